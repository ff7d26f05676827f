//! The worker: resolve, gate, run, then deliver what the task left behind.

use relayproto::msg::Outbound;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::{App, Job, Queued};
use crate::command::{Call, Command, CommandError, Origin};
use crate::relay::BrokerLink;
use crate::task::{Task, TaskOutcome};

/// Process jobs strictly in arrival order until every sender is gone.
pub async fn run_worker(mut app: App, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        run_job(&mut app, job).await;
    }
    info!("worker queue closed");
}

pub async fn run_job(app: &mut App, job: Job) -> Option<TaskOutcome> {
    match job {
        Job::Attach(link) => {
            info!(link = %link.id(), "broker link attached");
            app.links.insert(link.id(), link);
            None
        }
        Job::Command(q) => dispatch(app, q).await,
    }
}

async fn dispatch(app: &mut App, q: Queued) -> Option<TaskOutcome> {
    let name = match relayproto::msg::command_name(&q.payload) {
        Ok(n) => n.to_string(),
        Err(e) => {
            warn!(conn = %q.conn, err = %e, "command without a name");
            return None;
        }
    };

    let Some((flags, handler)) = app.registry().get(&name).map(|d| (d.flags, d.handler)) else {
        report(app, &q, &name, CommandError::Unrecognized(name.clone()));
        return None;
    };

    let cmd = match Command::decode(q.payload.clone()) {
        Ok(c) => c,
        Err(e) => {
            report(app, &q, &name, e);
            return None;
        }
    };

    let link = q.link.and_then(|l| app.links.get(&l).cloned());
    let origin = if flags.isserver {
        if !q.conn.is_control() {
            report(app, &q, &name, CommandError::NotHere(name.clone()));
            return None;
        }
        Origin::Server { link }
    } else if flags.preconnection {
        match link {
            Some(link) if !q.conn.is_control() => Origin::Preconnection {
                link,
                conn_id: q.conn,
            },
            _ => {
                warn!(
                    cmd = %name,
                    conn = %q.conn,
                    "preconnection command without a player transport"
                );
                return None;
            }
        }
    } else {
        match app.conns.get(q.conn) {
            Some(c) => Origin::Player(c.clone()),
            None => {
                warn!(cmd = %name, conn = %q.conn, "command from unknown connection; dropped");
                return None;
            }
        }
    };

    if !flags.noneedmongo && !app.store_available() {
        report(app, &q, &name, CommandError::NoStore);
        return None;
    }

    debug!(cmd = %name, conn = %q.conn, "dispatch");
    let mut task = Task::new(q.link);
    let res = handler(app, &mut task, Call { cmd, origin }).await;
    if let Err(e) = res {
        report(app, &q, &name, e);
    }

    let outcome = task.finish();
    deliver_updates(app, &outcome);
    Some(outcome)
}

/// Tell the originator what went wrong. Control-plane failures are only logged.
fn report(app: &App, q: &Queued, name: &str, err: CommandError) {
    let msg = match &err {
        CommandError::Message(text) => Outbound::Message { text: text.clone() },
        CommandError::NoStore => Outbound::Message {
            text: err.to_string(),
        },
        CommandError::Internal(e) => {
            error!(cmd = %name, conn = %q.conn, err = ?e, "command failed");
            Outbound::Error {
                text: format!("Internal error: {e}"),
            }
        }
        other => {
            warn!(cmd = %name, conn = %q.conn, err = %other, "command error");
            Outbound::Error {
                text: other.to_string(),
            }
        }
    };

    if q.conn.is_control() {
        if matches!(err, CommandError::Message(_) | CommandError::NoStore) {
            info!(cmd = %name, err = %err, "server command refused");
        }
        return;
    }
    match originator(app, q) {
        Some(link) => {
            link.send(q.conn, &msg);
        }
        None => debug!(cmd = %name, conn = %q.conn, "originator gone; error not delivered"),
    }
}

fn originator(app: &App, q: &Queued) -> Option<BrokerLink> {
    app.conns
        .get(q.conn)
        .map(|c| c.link.clone())
        .or_else(|| q.link.and_then(|l| app.links.get(&l).cloned()))
}

/// Default outbound collaborator: one `refresh` per stale connection.
pub fn deliver_updates(app: &App, outcome: &TaskOutcome) {
    for (conn, bits) in outcome.refreshes(&app.conns) {
        if let Some(c) = app.conns.get(conn) {
            c.write(&Outbound::Refresh {
                facets: bits.facets(),
            });
        }
    }
    for ch in &outcome.changes {
        debug!(coll = ch.coll, key = ch.key, field = %ch.field, "data change");
    }
}
