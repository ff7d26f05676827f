//! Per-command unit of work.
//!
//! A `Task` collects which facets of which players' views went stale and which
//! persisted fields changed. When the handler returns the task is turned into a
//! `TaskOutcome` for the outbound side.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::{BitOr, BitOrAssign};

use chrono::{DateTime, Utc};
use relayproto::msg::Outbound;
use relayproto::{ConnId, PlayerId};

use crate::playconn::PlayerConns;
use crate::relay::LinkId;
use crate::store::{InstanceId, LocationId, Store};

/// Coarse invalidation flags for a player's client view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dirty(u8);

impl Dirty {
    pub const FOCUS: Dirty = Dirty(0x01);
    pub const LOCALE: Dirty = Dirty(0x02);
    pub const WORLD: Dirty = Dirty(0x04);
    pub const POPULACE: Dirty = Dirty(0x08);
    pub const ALL: Dirty = Dirty(0x0f);

    pub fn contains(self, other: Dirty) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn facets(self) -> Vec<String> {
        [
            (Dirty::FOCUS, "focus"),
            (Dirty::LOCALE, "locale"),
            (Dirty::WORLD, "world"),
            (Dirty::POPULACE, "populace"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| name.to_string())
        .collect()
    }
}

impl BitOr for Dirty {
    type Output = Dirty;

    fn bitor(self, rhs: Dirty) -> Dirty {
        Dirty(self.0 | rhs.0)
    }
}

impl BitOrAssign for Dirty {
    fn bitor_assign(&mut self, rhs: Dirty) {
        self.0 |= rhs.0;
    }
}

/// A fine-grained persisted-field change: `(collection, key, field)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataChange {
    pub coll: &'static str,
    pub key: u64,
    pub field: String,
}

impl DataChange {
    pub fn new(coll: &'static str, key: u64, field: impl Into<String>) -> Self {
        Self {
            coll,
            key,
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct LocaleSnapshot {
    at: Option<(InstanceId, LocationId)>,
    members: Vec<PlayerId>,
}

#[derive(Debug)]
pub struct Task {
    pub start: DateTime<Utc>,
    /// The broker link the command arrived on, if any.
    pub link: Option<LinkId>,
    dirty: HashMap<PlayerId, Dirty>,
    conn_dirty: HashMap<ConnId, Dirty>,
    changes: BTreeSet<DataChange>,
    locales: HashMap<PlayerId, LocaleSnapshot>,
}

impl Task {
    pub fn new(link: Option<LinkId>) -> Self {
        Self {
            start: Utc::now(),
            link,
            dirty: HashMap::new(),
            conn_dirty: HashMap::new(),
            changes: BTreeSet::new(),
            locales: HashMap::new(),
        }
    }

    pub fn set_dirty<I>(&mut self, uids: I, bits: Dirty)
    where
        I: IntoIterator<Item = PlayerId>,
    {
        for uid in uids {
            *self.dirty.entry(uid).or_default() |= bits;
        }
    }

    /// Mark one connection (not every connection of its player) stale.
    pub fn set_conn_dirty(&mut self, conn: ConnId, bits: Dirty) {
        *self.conn_dirty.entry(conn).or_default() |= bits;
    }

    #[cfg(test)]
    pub fn dirty_for(&self, uid: PlayerId) -> Dirty {
        self.dirty.get(&uid).copied().unwrap_or_default()
    }

    pub fn set_data_change(&mut self, coll: &'static str, key: u64, field: impl Into<String>) {
        self.changes.insert(DataChange::new(coll, key, field));
    }

    /// Other players sharing `uid`'s (instance, location).
    ///
    /// The first query for a player within a task pins that player's locale and its
    /// occupants; later queries in the same task answer from that snapshot even if
    /// the handler has since written new positions.
    pub async fn find_locale_players(
        &mut self,
        db: &dyn Store,
        uid: PlayerId,
        notself: bool,
    ) -> anyhow::Result<Vec<PlayerId>> {
        if !self.locales.contains_key(&uid) {
            let at = db.playstate(uid).await?.and_then(|ps| ps.locale());
            let members = match at {
                Some((iid, locid)) => db.players_at(iid, locid).await?,
                None => Vec::new(),
            };
            self.locales.insert(uid, LocaleSnapshot { at, members });
        }

        let snap = &self.locales[&uid];
        if snap.at.is_none() {
            return Ok(Vec::new());
        }
        let mut out = snap
            .members
            .iter()
            .copied()
            .filter(|p| !(notself && *p == uid))
            .collect::<Vec<_>>();
        if !notself && !out.contains(&uid) {
            out.push(uid);
        }
        out.sort();
        Ok(out)
    }

    /// Drop the pinned locale for `uid` so the next query re-reads it.
    pub fn clear_locale(&mut self, uid: PlayerId) {
        self.locales.remove(&uid);
    }

    /// Deliver a narrative line to every live connection of the named players, now.
    pub fn write_event<I>(&self, conns: &PlayerConns, uids: I, text: &str)
    where
        I: IntoIterator<Item = PlayerId>,
    {
        let msg = Outbound::Event {
            text: text.to_string(),
        };
        for uid in uids {
            for c in conns.for_player(uid) {
                c.write(&msg);
            }
        }
    }

    pub fn finish(self) -> TaskOutcome {
        TaskOutcome {
            dirty: self.dirty.into_iter().collect(),
            conn_dirty: self.conn_dirty.into_iter().collect(),
            changes: self.changes,
        }
    }
}

/// What a finished task leaves behind for the outbound collaborator.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub dirty: BTreeMap<PlayerId, Dirty>,
    pub conn_dirty: BTreeMap<ConnId, Dirty>,
    pub changes: BTreeSet<DataChange>,
}

impl TaskOutcome {
    #[cfg(test)]
    pub fn dirty_for(&self, uid: PlayerId) -> Dirty {
        self.dirty.get(&uid).copied().unwrap_or_default()
    }

    #[cfg(test)]
    pub fn has_change(&self, coll: &str, key: u64, field: &str) -> bool {
        self.changes
            .iter()
            .any(|c| c.coll == coll && c.key == key && c.field == field)
    }

    /// Per-connection facets to re-send: the player's bits merged with any
    /// connection-specific bits.
    pub fn refreshes(&self, conns: &PlayerConns) -> BTreeMap<ConnId, Dirty> {
        let mut out: BTreeMap<ConnId, Dirty> = BTreeMap::new();
        for (uid, bits) in &self.dirty {
            for c in conns.for_player(*uid) {
                *out.entry(c.conn_id).or_default() |= *bits;
            }
        }
        for (conn, bits) in &self.conn_dirty {
            if conns.get(*conn).is_some() {
                *out.entry(*conn).or_default() |= *bits;
            }
        }
        out.retain(|_, bits| !bits.is_empty());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::{Collections, MemStore};
    use crate::relay::BrokerLink;
    use crate::store::{PlayState, PlayStateUpdate};

    #[test]
    fn dirty_bits_accumulate_monotonically() {
        let mut t = Task::new(None);
        t.set_dirty([PlayerId(1)], Dirty::FOCUS);
        t.set_dirty([PlayerId(1), PlayerId(2)], Dirty::POPULACE);
        t.set_dirty([PlayerId(1)], Dirty::FOCUS);
        t.set_dirty([PlayerId(1)], Dirty::default());

        assert_eq!(t.dirty_for(PlayerId(1)), Dirty::FOCUS | Dirty::POPULACE);
        assert_eq!(t.dirty_for(PlayerId(2)), Dirty::POPULACE);
        assert_eq!(t.dirty_for(PlayerId(3)), Dirty::default());

        t.set_dirty([PlayerId(1)], Dirty::ALL);
        let out = t.finish();
        assert_eq!(out.dirty_for(PlayerId(1)), Dirty::ALL);
        assert_eq!(
            out.dirty_for(PlayerId(1)).facets(),
            vec!["focus", "locale", "world", "populace"]
        );
    }

    #[test]
    fn data_changes_are_a_set() {
        let mut t = Task::new(None);
        t.set_data_change("playstate", 1, "iid");
        t.set_data_change("playstate", 1, "iid");
        t.set_data_change("playstate", 1, "locid");
        let out = t.finish();
        assert_eq!(out.changes.len(), 2);
        assert!(out.has_change("playstate", 1, "locid"));
    }

    #[tokio::test]
    async fn locale_query_is_pinned_for_the_task() {
        let mut ps1 = PlayState::void(PlayerId(1));
        ps1.iid = Some(InstanceId(1));
        ps1.locid = Some(LocationId(10));
        let mut ps2 = ps1.clone();
        ps2.id = PlayerId(2);
        let db = MemStore::new(Collections {
            playstate: vec![ps1, ps2],
            ..Default::default()
        });

        let mut t = Task::new(None);
        let others = t.find_locale_players(&db, PlayerId(1), true).await.unwrap();
        assert_eq!(others, vec![PlayerId(2)]);

        db.update_playstate(
            PlayerId(2),
            PlayStateUpdate {
                iid: Some(None),
                locid: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let again = t.find_locale_players(&db, PlayerId(1), true).await.unwrap();
        assert_eq!(again, vec![PlayerId(2)]);
        let everyone = t.find_locale_players(&db, PlayerId(1), false).await.unwrap();
        assert_eq!(everyone, vec![PlayerId(1), PlayerId(2)]);

        t.clear_locale(PlayerId(1));
        let fresh = t.find_locale_players(&db, PlayerId(1), true).await.unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn void_players_have_no_locale() {
        let db = MemStore::new(Collections {
            playstate: vec![PlayState::void(PlayerId(1))],
            ..Default::default()
        });
        let mut t = Task::new(None);
        assert!(t
            .find_locale_players(&db, PlayerId(1), false)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn write_event_reaches_every_connection_immediately() {
        let (link, mut rx) = BrokerLink::channel(LinkId(1));
        let mut conns = PlayerConns::new();
        conns.add(ConnId(1), PlayerId(1), "a", link.clone());
        conns.add(ConnId(2), PlayerId(1), "a", link.clone());
        conns.add(ConnId(3), PlayerId(2), "b", link);

        let t = Task::new(None);
        t.write_event(&conns, [PlayerId(1)], "The world fades away.");

        let mut got = Vec::new();
        while let Ok(env) = rx.try_recv() {
            got.push(env.conn);
        }
        got.sort();
        assert_eq!(got, vec![ConnId(1), ConnId(2)]);
    }

    #[test]
    fn refreshes_merge_player_and_connection_bits() {
        let (link, _rx) = BrokerLink::channel(LinkId(1));
        let mut conns = PlayerConns::new();
        conns.add(ConnId(1), PlayerId(1), "a", link.clone());
        conns.add(ConnId(2), PlayerId(1), "a", link);

        let mut t = Task::new(None);
        t.set_dirty([PlayerId(1)], Dirty::FOCUS);
        t.set_conn_dirty(ConnId(2), Dirty::ALL);
        t.set_conn_dirty(ConnId(99), Dirty::ALL);
        let r = t.finish().refreshes(&conns);
        assert_eq!(r.len(), 2);
        assert_eq!(r[&ConnId(1)], Dirty::FOCUS);
        assert_eq!(r[&ConnId(2)], Dirty::ALL);
    }
}
