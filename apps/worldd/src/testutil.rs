//! A worker context over a seeded in-memory store and one in-process broker link.

use std::sync::Arc;

use relayproto::frame::Envelope;
use relayproto::msg::Outbound;
use relayproto::{ConnId, PlayerId};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::app::{App, Job, Queued, StoreHandle};
use crate::commands::define_commands;
use crate::config::Config;
use crate::dispatch::run_job;
use crate::docstore::{Collections, MemStore};
use crate::relay::{BrokerLink, LinkId};
use crate::store::{
    ConfigEntry, Location, LocationId, PlayState, Player, Portal, PortalId, PortalListId, Scope,
    ScopeId, Store, World, WorldId,
};
use crate::task::TaskOutcome;

pub const ALICE: PlayerId = PlayerId(1);
pub const BOB: PlayerId = PlayerId(2);
pub const START: LocationId = LocationId(10);
pub const HALL: LocationId = LocationId(11);

pub const LINK: LinkId = LinkId(1);

fn player(id: PlayerId, name: &str, plistid: u64) -> Player {
    Player {
        id,
        name: name.to_string(),
        scid: ScopeId(5),
        plistid: PortalListId(plistid),
        pronoun: None,
        desc: None,
    }
}

fn portal(id: u64, listpos: i64, locid: u64) -> Portal {
    Portal {
        id: PortalId(id),
        plistid: PortalListId(1),
        listpos,
        wid: WorldId(1),
        scid: ScopeId(5),
        locid: LocationId(locid),
    }
}

/// One world with two rooms, one scope, two players in the void.
pub fn seed() -> Collections {
    Collections {
        players: vec![player(ALICE, "Alice", 1), player(BOB, "Bob", 2)],
        playstate: vec![PlayState::void(ALICE), PlayState::void(BOB)],
        worlds: vec![World {
            id: WorldId(1),
            name: "Start World".to_string(),
        }],
        scopes: vec![Scope {
            id: ScopeId(5),
            name: "Personal".to_string(),
        }],
        locations: vec![
            Location {
                id: START,
                wid: WorldId(1),
                key: "start".to_string(),
                name: "The Start".to_string(),
            },
            Location {
                id: HALL,
                wid: WorldId(1),
                key: "hall".to_string(),
                name: "The Hall".to_string(),
            },
        ],
        portals: vec![portal(100, 2, HALL.0), portal(101, 1, START.0), portal(102, 0, 999)],
        config: vec![
            ConfigEntry {
                key: "startworldid".to_string(),
                val: json!(1),
            },
            ConfigEntry {
                key: "startworldloc".to_string(),
                val: json!("start"),
            },
        ],
        ..Default::default()
    }
}

pub struct Fixture {
    pub app: App,
    pub db: Arc<MemStore>,
    pub link: BrokerLink,
    db_tx: watch::Sender<StoreHandle>,
    out: mpsc::UnboundedReceiver<Envelope>,
    jobs: mpsc::UnboundedReceiver<Job>,
}

impl Fixture {
    pub async fn new() -> Self {
        let db = Arc::new(MemStore::new(seed()));
        let (db_tx, db_rx) = watch::channel::<StoreHandle>(Some(db.clone()));
        let (jobs_tx, jobs) = mpsc::unbounded_channel();
        let registry = Arc::new(define_commands().expect("registry"));
        let mut app = App::new(Arc::new(Config::default()), db_rx, jobs_tx, registry);

        let (link, out) = BrokerLink::channel(LINK);
        run_job(&mut app, Job::Attach(link.clone())).await;

        Self {
            app,
            db,
            link,
            db_tx,
            out,
            jobs,
        }
    }

    pub fn attach(&mut self, conn: ConnId, uid: PlayerId) {
        let email = format!("player{}@example.com", uid.0);
        self.app.conns.add(conn, uid, email, self.link.clone());
    }

    /// Run one inbound command as if it arrived over the fixture's link.
    pub async fn run(&mut self, conn: ConnId, payload: serde_json::Value) -> Option<TaskOutcome> {
        let q = Queued {
            conn,
            link: Some(LINK),
            payload,
        };
        run_job(&mut self.app, Job::Command(q)).await
    }

    pub async fn portin(&mut self, uid: PlayerId) -> Option<TaskOutcome> {
        self.run(ConnId::CONTROL, json!({"cmd": "portin", "uid": uid.0}))
            .await
    }

    /// Run queued follow-ups (and theirs) until the queue is empty.
    pub async fn pump(&mut self) -> usize {
        let mut n = 0;
        while let Ok(job) = self.jobs.try_recv() {
            run_job(&mut self.app, job).await;
            n += 1;
        }
        n
    }

    /// Drain the queue without running anything.
    pub fn queued_jobs(&mut self) -> Vec<Queued> {
        let mut v = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            if let Job::Command(q) = job {
                v.push(q);
            }
        }
        v
    }

    pub fn queued(&mut self) -> Vec<serde_json::Value> {
        self.queued_jobs().into_iter().map(|q| q.payload).collect()
    }

    /// Everything written to the broker link so far, decoded.
    pub fn sent(&mut self) -> Vec<(ConnId, Outbound)> {
        let mut v = Vec::new();
        while let Ok(env) = self.out.try_recv() {
            let msg = serde_json::from_slice(&env.payload).expect("outbound json");
            v.push((env.conn, msg));
        }
        v
    }

    pub async fn playstate(&self, uid: PlayerId) -> PlayState {
        self.db
            .playstate(uid)
            .await
            .unwrap()
            .unwrap_or_else(|| PlayState::void(uid))
    }

    pub async fn seed(&self, f: impl FnOnce(&mut Collections)) {
        self.db.edit(f).await;
    }

    pub fn take_store(&self) {
        self.db_tx.send_replace(None);
    }

    pub fn restore_store(&self) {
        self.db_tx.send_replace(Some(self.db.clone()));
    }
}

pub fn events_for(sent: &[(ConnId, Outbound)], conn: ConnId) -> Vec<String> {
    sent.iter()
        .filter(|(c, _)| *c == conn)
        .filter_map(|(_, m)| match m {
            Outbound::Event { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

pub fn conns_in(sent: &[(ConnId, Outbound)]) -> Vec<ConnId> {
    let mut v = sent.iter().map(|(c, _)| *c).collect::<Vec<_>>();
    v.sort();
    v.dedup();
    v
}
