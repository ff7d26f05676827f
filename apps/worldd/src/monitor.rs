//! Store availability monitor.
//!
//! Probes the live handle while one exists and tries to open a fresh one while
//! none does. The current handle (or `None`) is published on a watch channel
//! that the worker reads before every command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::StoreHandle;
use crate::store::StoreConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// A previous check was still in flight.
    Skipped,
    Done(Availability),
}

pub struct StoreMonitor {
    connector: Arc<dyn StoreConnector>,
    tx: watch::Sender<StoreHandle>,
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl StoreMonitor {
    pub fn new(connector: Arc<dyn StoreConnector>) -> (Arc<Self>, watch::Receiver<StoreHandle>) {
        let (tx, rx) = watch::channel(None);
        let m = Arc::new(Self {
            connector,
            tx,
            busy: AtomicBool::new(false),
        });
        (m, rx)
    }

    pub fn availability(&self) -> Availability {
        if self.tx.borrow().is_some() {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }

    pub async fn check(&self) -> CheckOutcome {
        if self.busy.swap(true, Ordering::AcqRel) {
            warn!("store monitor: already in flight; did a previous check jam?");
            return CheckOutcome::Skipped;
        }
        let _guard = BusyGuard(&self.busy);

        let current = self.tx.borrow().clone();
        if let Some(db) = current {
            let alive = match db.ping().await {
                Ok(true) => true,
                Ok(false) => {
                    error!("store not alive");
                    false
                }
                Err(e) => {
                    error!(err = %e, "store not alive");
                    false
                }
            };
            if !alive {
                // Dropping the last Arc releases the handle.
                self.tx.send_replace(None);
            }
        }

        if self.tx.borrow().is_none() {
            match self.connector.open().await {
                Ok(db) => {
                    self.tx.send_replace(Some(db));
                    info!("store open");
                }
                Err(e) => {
                    error!(err = %e, "store not open");
                }
            }
        }

        CheckOutcome::Done(self.availability())
    }

    /// Check once now, then every `period`. Each check runs on its own task so a
    /// jammed probe shows up as skipped cycles instead of a stalled timer.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut iv = tokio::time::interval(period);
            iv.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                iv.tick().await;
                let m = self.clone();
                tokio::spawn(async move {
                    m.check().await;
                });
            }
        })
    }
}
