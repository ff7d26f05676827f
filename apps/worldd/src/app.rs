//! The owned context every handler runs against.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relayproto::{ConnId, PlayerId};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::command::{CommandError, Registry};
use crate::config::Config;
use crate::playconn::PlayerConns;
use crate::relay::{BrokerLink, LinkId};
use crate::store::Store;

pub type StoreHandle = Option<Arc<dyn Store>>;

/// One inbound command with its routing context.
#[derive(Debug, Clone)]
pub struct Queued {
    pub conn: ConnId,
    pub link: Option<LinkId>,
    pub payload: serde_json::Value,
}

impl Queued {
    pub fn control(payload: serde_json::Value, link: Option<LinkId>) -> Self {
        Self {
            conn: ConnId::CONTROL,
            link,
            payload,
        }
    }
}

#[derive(Debug)]
pub enum Job {
    /// A broker link came up.
    Attach(BrokerLink),
    Command(Queued),
}

pub struct App {
    pub cfg: Arc<Config>,
    pub conns: PlayerConns,
    pub links: HashMap<LinkId, BrokerLink>,
    /// First sweep at which an in-world player was seen with no connection.
    pub void_strikes: HashMap<PlayerId, DateTime<Utc>>,
    db: watch::Receiver<StoreHandle>,
    jobs: mpsc::UnboundedSender<Job>,
    registry: Arc<Registry>,
}

impl App {
    pub fn new(
        cfg: Arc<Config>,
        db: watch::Receiver<StoreHandle>,
        jobs: mpsc::UnboundedSender<Job>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            cfg,
            conns: PlayerConns::new(),
            links: HashMap::new(),
            void_strikes: HashMap::new(),
            db,
            jobs,
            registry,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store_available(&self) -> bool {
        self.db.borrow().is_some()
    }

    /// The current store handle, or `NoStore` while the monitor has none.
    pub fn store(&self) -> Result<Arc<dyn Store>, CommandError> {
        self.db.borrow().clone().ok_or(CommandError::NoStore)
    }

    fn route(&self, conn: Option<ConnId>) -> Queued {
        let conn = conn.unwrap_or(ConnId::CONTROL);
        let link = self.conns.get(conn).map(|c| c.link.id());
        Queued {
            conn,
            link,
            payload: serde_json::Value::Null,
        }
    }

    /// Run `payload` after the current job, on behalf of `conn` (or the control plane).
    pub fn queue_command(&self, payload: serde_json::Value, conn: Option<ConnId>) {
        let q = Queued {
            payload,
            ..self.route(conn)
        };
        if self.jobs.send(Job::Command(q)).is_err() {
            warn!("worker queue closed; dropping queued command");
        }
    }

    /// Like `queue_command`, but only after `delay`. There is no cancellation.
    pub fn schedule_command(
        &self,
        payload: serde_json::Value,
        conn: Option<ConnId>,
        delay: Duration,
    ) {
        let q = Queued {
            payload,
            ..self.route(conn)
        };
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if jobs.send(Job::Command(q)).is_err() {
                warn!("worker queue closed; dropping scheduled command");
            }
        });
    }
}
