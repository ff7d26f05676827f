//! Broker and timer commands. These never come from a player.

use std::time::Duration;

use futures_util::future::BoxFuture;
use relayproto::msg::{Outbound, PlistEntry};
use tracing::{debug, info, warn};

use super::{mismatch, player_name, start_destination};
use crate::app::App;
use crate::command::{Call, CmdResult, Command, CommandError, Origin};
use crate::store::{PlayStateUpdate, Portal, Store};
use crate::task::{Dirty, Task};

/// How long a player hangs in the void between `tovoid` and the follow-up `portin`.
pub const PORTIN_DELAY: Duration = Duration::from_millis(1500);

pub(super) fn cmd_connect<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let Command::Connect { connections } = call.cmd else {
            return Err(mismatch("connect"));
        };
        let Origin::Server { link: Some(link) } = call.origin else {
            return Err(anyhow::anyhow!("connect from no broker link").into());
        };

        link.send_control(&Outbound::Connectok);

        // Accept whatever the broker is still holding.
        let available = app.store_available();
        for rc in connections {
            if rc.connid.is_control() {
                warn!(uid = %rc.uid, email = %rc.email, "resumed connection uses the control id");
                link.send_control(&Outbound::Playernotok {
                    connid: rc.connid,
                    text: "Invalid connection id.".to_string(),
                });
                continue;
            }
            if !available {
                link.send_control(&Outbound::Playernotok {
                    connid: rc.connid,
                    text: CommandError::NoStore.to_string(),
                });
                continue;
            }
            app.conns.add(rc.connid, rc.uid, rc.email.clone(), link.clone());
            link.send_control(&Outbound::Playerok { connid: rc.connid });
            app.queue_command(
                Command::Connrefreshall { connid: rc.connid }.to_payload(),
                None,
            );
            info!(
                conn = %rc.connid,
                uid = %rc.uid,
                email = %rc.email,
                "player has reconnected"
            );
            // No portin: a resumed player is no more likely to be in the void than usual.
        }
        Ok(())
    })
}

pub(super) fn cmd_disconnect<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    _call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let Some(lid) = task.link else {
            warn!("disconnect without a broker link");
            return Ok(());
        };
        for cid in app.conns.on_link(lid) {
            if let Err(e) = app.conns.remove(cid) {
                debug!(conn = %cid, err = %e, "already gone");
            }
        }
        app.links.remove(&lid);
        warn!(link = %lid, remaining = app.conns.len(), "broker has disconnected");
        Ok(())
    })
}

pub(super) fn cmd_checkdisconnected<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    _call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let db = app.store()?;
        let inworld = db.in_world().await?;
        let grace = chrono::Duration::from_std(app.cfg.void_grace)
            .map_err(|e| anyhow::anyhow!("void grace out of range: {e}"))?;

        // Strikes only last while the player stays in-world and unconnected.
        let conns = &app.conns;
        app.void_strikes
            .retain(|uid, _| inworld.contains(uid) && conns.count_for_player(*uid) == 0);

        let mut gone = Vec::new();
        for uid in &inworld {
            if app.conns.count_for_player(*uid) > 0 {
                continue;
            }
            let first = *app.void_strikes.entry(*uid).or_insert(task.start);
            if task.start - first >= grace {
                gone.push(*uid);
            }
        }

        info!(
            inworld = inworld.len(),
            disconnected = gone.len(),
            "checkdisconnected"
        );
        for uid in gone {
            app.void_strikes.remove(&uid);
            app.queue_command(
                Command::Tovoid {
                    uid,
                    portin: false,
                    portto: None,
                }
                .to_payload(),
                None,
            );
        }
        Ok(())
    })
}

pub(super) fn cmd_tovoid<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let Command::Tovoid { uid, portin, portto } = call.cmd else {
            return Err(mismatch("tovoid"));
        };
        let db = app.store()?;

        task.write_event(&app.conns, [uid], "The world fades away.");
        let others = task.find_locale_players(&*db, uid, true).await?;
        if !others.is_empty() {
            let name = player_name(&*db, uid).await?;
            task.set_dirty(others.iter().copied(), Dirty::POPULACE);
            task.write_event(&app.conns, others, &format!("{name} disappears."));
        }

        // With no portto, the next portin falls back to the start world.
        db.update_playstate(
            uid,
            PlayStateUpdate {
                iid: Some(None),
                locid: Some(None),
                focus: Some(None),
                portto: Some(portto),
                lastmoved: Some(task.start),
            },
        )
        .await?;
        task.set_dirty([uid], Dirty::ALL);
        task.set_data_change("playstate", uid.0, "iid");
        task.set_data_change("playstate", uid.0, "locid");

        if portin {
            app.schedule_command(Command::Portin { uid }.to_payload(), None, PORTIN_DELAY);
        }
        Ok(())
    })
}

pub(super) fn cmd_logplayerconntable<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    _call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        app.conns.dump_log();
        Ok(())
    })
}

pub(super) fn cmd_connrefreshall<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let Command::Connrefreshall { connid } = call.cmd else {
            return Err(mismatch("connrefreshall"));
        };
        if app.conns.get(connid).is_none() {
            return Ok(());
        }
        // This one connection, not every connection of the player.
        task.set_conn_dirty(connid, Dirty::ALL);
        app.queue_command(Command::Connupdateplist { connid }.to_payload(), None);
        Ok(())
    })
}

pub(super) fn cmd_connupdateplist<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let Command::Connupdateplist { connid } = call.cmd else {
            return Err(mismatch("connupdateplist"));
        };
        let Some(conn) = app.conns.get(connid).cloned() else {
            return Ok(());
        };
        let db = app.store()?;
        let Some(player) = db.player(conn.uid).await? else {
            return Ok(());
        };
        if db.playstate(conn.uid).await?.is_none() {
            return Ok(());
        }

        let mut portals = db.portals(player.plistid).await?;
        portals.sort_by_key(|p| p.listpos);
        let mut plist = Vec::with_capacity(portals.len());
        for portal in &portals {
            match describe_portal(&*db, portal).await? {
                Some(entry) => plist.push(entry),
                None => {
                    debug!(portal = %portal.id, uid = %conn.uid, "skipping unresolvable portal")
                }
            }
        }
        debug!(conn = %connid, entries = plist.len(), "sending plist update");
        conn.write(&Outbound::Updateplist { plist });
        Ok(())
    })
}

async fn describe_portal(db: &dyn Store, portal: &Portal) -> anyhow::Result<Option<PlistEntry>> {
    let Some(world) = db.world(portal.wid).await? else {
        return Ok(None);
    };
    let Some(scope) = db.scope(portal.scid).await? else {
        return Ok(None);
    };
    let Some(loc) = db.location(portal.locid).await? else {
        return Ok(None);
    };
    let location = if loc.name.is_empty() { loc.key } else { loc.name };
    Ok(Some(PlistEntry {
        portid: portal.id.0,
        world: world.name,
        scope: scope.name,
        location,
    }))
}

pub(super) fn cmd_portin<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let Command::Portin { uid } = call.cmd else {
            return Err(mismatch("portin"));
        };
        let db = app.store()?;

        let player = db.player(uid).await?;
        let ps = db.playstate(uid).await?;
        let (Some(player), Some(ps)) = (player, ps) else {
            return Err(CommandError::error_message(format!(
                "Portin: no such player: {uid}"
            )));
        };
        if ps.locale().is_some() {
            info!(uid = %uid, name = %player.name, "player is already in the world");
            return Ok(());
        }

        let dest = match ps.portto {
            Some(d) => d,
            None => start_destination(&*db, player.scid).await?,
        };
        info!(uid = %uid, wid = %dest.wid, scid = %dest.scid, locid = %dest.locid, "player portin");

        let minaccess = db
            .instance_for(dest.wid, dest.scid)
            .await?
            .map(|i| i.minaccess)
            .unwrap_or_default();
        if db.scope_access(uid, dest.scid).await? < minaccess {
            task.write_event(&app.conns, [uid], "You do not have access to this instance.");
            return Ok(());
        }

        let (inst, created) = db.create_instance(dest.wid, dest.scid).await?;
        if created {
            info!(iid = %inst.id, wid = %dest.wid, scid = %dest.scid, "created instance");
        }

        db.update_playstate(
            uid,
            PlayStateUpdate {
                iid: Some(Some(inst.id)),
                locid: Some(Some(dest.locid)),
                focus: Some(None),
                portto: Some(None),
                lastmoved: Some(task.start),
            },
        )
        .await?;
        task.set_dirty([uid], Dirty::ALL);
        task.set_data_change("playstate", uid.0, "iid");
        task.set_data_change("playstate", uid.0, "locid");

        let others = task.find_locale_players(&*db, uid, true).await?;
        if !others.is_empty() {
            task.set_dirty(others.iter().copied(), Dirty::POPULACE);
            task.write_event(&app.conns, others, &format!("{} appears.", player.name));
        }
        task.write_event(&app.conns, [uid], "You are somewhere new.");
        Ok(())
    })
}
