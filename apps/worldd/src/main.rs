mod app;
mod command;
mod commands;
mod config;
mod dispatch;
mod docstore;
mod monitor;
mod playconn;
mod relay;
mod store;
mod task;
#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app::{App, Job, Queued};
use crate::command::Command;
use crate::config::parse_args;
use crate::docstore::FileConnector;
use crate::monitor::StoreMonitor;
use crate::relay::LinkId;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worldd=info".into()),
        )
        .with_target(false)
        .init();

    let cfg = Arc::new(parse_args());
    let registry = Arc::new(commands::define_commands()?);
    info!(commands = registry.len(), "command registry ready");

    let connector = Arc::new(FileConnector::new(cfg.db_path.clone()));
    info!(
        path = %connector.path().display(),
        probe_ms = cfg.db_probe.as_millis() as u64,
        "store monitor starting"
    );
    let (monitor, db_rx) = StoreMonitor::new(connector);
    let _probe = monitor.spawn(cfg.db_probe);

    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let app = App::new(cfg.clone(), db_rx, jobs_tx.clone(), registry);
    let _worker = tokio::spawn(dispatch::run_worker(app, jobs_rx));
    spawn_sweep(cfg.sweep, jobs_tx.clone());

    let listener = TcpListener::bind(cfg.bind).await?;
    info!(bind = %cfg.bind, "worldd listening");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut next_link = 1u64;
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let id = LinkId(next_link);
                next_link += 1;
                info!(peer = %peer, link = %id, "broker connected");
                let jobs = jobs_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = relay::serve_broker(stream, peer, id, jobs).await {
                        warn!(peer = %peer, link = %id, err = %e, "broker link ended with error");
                    }
                });
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!(err = %e, "ctrl-c handler failed");
                }
                info!("shutting down");
                break;
            }
        }
    }

    // Let queued writes reach the brokers.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

/// Queue `checkdisconnected` every `period`, starting one period from now.
fn spawn_sweep(period: Duration, jobs: mpsc::UnboundedSender<Job>) {
    tokio::spawn(async move {
        let mut iv = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            iv.tick().await;
            let q = Queued::control(Command::Checkdisconnected.to_payload(), None);
            if jobs.send(Job::Command(q)).is_err() {
                return;
            }
        }
    });
}
