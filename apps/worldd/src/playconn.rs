use std::collections::{BTreeSet, HashMap, HashSet};

use relayproto::msg::Outbound;
use relayproto::{ConnId, PlayerId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::relay::{BrokerLink, LinkId};
use crate::store::LocationId;

/// Something a player can do from what their client currently shows.
///
/// The display layer fills the per-connection action maps; `action` only ever
/// runs entries found there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Focus {
        target: String,
    },
    Event {
        text: String,
        #[serde(default)]
        otext: Option<String>,
    },
    Move {
        loc: LocationId,
        #[serde(default)]
        text: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub conn_id: ConnId,
    pub uid: PlayerId,
    pub email: String,
    pub link: BrokerLink,

    // Cached by the display layer for incremental diffing.
    pub locale_actions: HashMap<String, Action>,
    pub populace_actions: HashMap<String, Action>,
    pub focus_actions: HashMap<String, Action>,
    pub locale_dependencies: BTreeSet<String>,
    pub populace_dependencies: BTreeSet<String>,
    pub focus_dependencies: BTreeSet<String>,
}

impl Connection {
    fn new(conn_id: ConnId, uid: PlayerId, email: String, link: BrokerLink) -> Self {
        Self {
            conn_id,
            uid,
            email,
            link,
            locale_actions: HashMap::new(),
            populace_actions: HashMap::new(),
            focus_actions: HashMap::new(),
            locale_dependencies: BTreeSet::new(),
            populace_dependencies: BTreeSet::new(),
            focus_dependencies: BTreeSet::new(),
        }
    }

    pub fn write(&self, msg: &Outbound) -> bool {
        self.link.send(self.conn_id, msg)
    }

    /// Look an action key up in the locale, focus, then populace maps.
    pub fn find_action(&self, key: &str) -> Option<&Action> {
        self.locale_actions
            .get(key)
            .or_else(|| self.focus_actions.get(key))
            .or_else(|| self.populace_actions.get(key))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnTableError {
    #[error("no such connection: {0}")]
    Unknown(ConnId),
}

/// Live player connections, keyed by connection id, with a per-player index.
#[derive(Debug, Default)]
pub struct PlayerConns {
    map: HashMap<ConnId, Connection>,
    by_player: HashMap<PlayerId, HashSet<ConnId>>,
}

impl PlayerConns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Re-adding a known id replaces the old entry.
    pub fn add(
        &mut self,
        conn_id: ConnId,
        uid: PlayerId,
        email: impl Into<String>,
        link: BrokerLink,
    ) -> &Connection {
        let _ = self.remove(conn_id);
        self.by_player.entry(uid).or_default().insert(conn_id);
        self.map
            .entry(conn_id)
            .or_insert_with(|| Connection::new(conn_id, uid, email.into(), link))
    }

    pub fn get(&self, conn_id: ConnId) -> Option<&Connection> {
        self.map.get(&conn_id)
    }

    #[cfg(test)]
    pub fn get_mut(&mut self, conn_id: ConnId) -> Option<&mut Connection> {
        self.map.get_mut(&conn_id)
    }

    pub fn remove(&mut self, conn_id: ConnId) -> Result<Connection, ConnTableError> {
        let conn = self
            .map
            .remove(&conn_id)
            .ok_or(ConnTableError::Unknown(conn_id))?;
        if let Some(set) = self.by_player.get_mut(&conn.uid) {
            set.remove(&conn_id);
            if set.is_empty() {
                self.by_player.remove(&conn.uid);
            }
        }
        Ok(conn)
    }

    pub fn count_for_player(&self, uid: PlayerId) -> usize {
        self.by_player.get(&uid).map_or(0, |s| s.len())
    }

    pub fn for_player(&self, uid: PlayerId) -> impl Iterator<Item = &Connection> + '_ {
        self.by_player
            .get(&uid)
            .into_iter()
            .flatten()
            .filter_map(|cid| self.map.get(cid))
    }

    pub fn on_link(&self, link: LinkId) -> Vec<ConnId> {
        let mut v = self
            .map
            .values()
            .filter(|c| c.link.id() == link)
            .map(|c| c.conn_id)
            .collect::<Vec<_>>();
        v.sort();
        v
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Every connection, ordered by id, for administrative listings.
    pub fn snapshot(&self) -> Vec<Connection> {
        let mut v = self.map.values().cloned().collect::<Vec<_>>();
        v.sort_by_key(|c| c.conn_id);
        v
    }

    pub fn dump_log(&self) {
        info!(count = self.map.len(), "player connection table");
        for c in self.snapshot() {
            info!(
                conn = %c.conn_id,
                uid = %c.uid,
                email = %c.email,
                link = %c.link.id(),
                "  connection"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: u64) -> BrokerLink {
        BrokerLink::channel(LinkId(id)).0
    }

    #[test]
    fn add_then_get_round_trips_identity() {
        let mut t = PlayerConns::new();
        t.add(ConnId(1), PlayerId(10), "a@example.com", link(1));
        let c = t.get(ConnId(1)).unwrap();
        assert_eq!(c.uid, PlayerId(10));
        assert_eq!(c.email, "a@example.com");
        assert!(t.get(ConnId(2)).is_none());
    }

    #[test]
    fn counts_follow_adds_and_removes() {
        let mut t = PlayerConns::new();
        assert_eq!(t.count_for_player(PlayerId(10)), 0);
        t.add(ConnId(1), PlayerId(10), "a@example.com", link(1));
        t.add(ConnId(2), PlayerId(10), "a@example.com", link(1));
        t.add(ConnId(3), PlayerId(11), "b@example.com", link(2));
        assert_eq!(t.count_for_player(PlayerId(10)), 2);
        assert_eq!(t.for_player(PlayerId(10)).count(), 2);

        t.remove(ConnId(1)).unwrap();
        t.remove(ConnId(2)).unwrap();
        assert_eq!(t.count_for_player(PlayerId(10)), 0);
        assert!(t.remove(ConnId(2)).is_err());
        assert_eq!(t.count_for_player(PlayerId(10)), 0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn remove_unknown_reports_the_id() {
        let mut t = PlayerConns::new();
        let err = t.remove(ConnId(77)).unwrap_err();
        assert!(err.to_string().contains("77"));
    }

    #[test]
    fn readding_moves_connection_to_new_owner() {
        let mut t = PlayerConns::new();
        t.add(ConnId(1), PlayerId(10), "a@example.com", link(1));
        t.add(ConnId(1), PlayerId(11), "b@example.com", link(1));
        assert_eq!(t.count_for_player(PlayerId(10)), 0);
        assert_eq!(t.count_for_player(PlayerId(11)), 1);
        assert_eq!(t.get(ConnId(1)).unwrap().email, "b@example.com");
    }

    #[test]
    fn snapshot_and_link_listing_are_ordered() {
        let mut t = PlayerConns::new();
        t.add(ConnId(3), PlayerId(1), "x", link(1));
        t.add(ConnId(1), PlayerId(2), "y", link(2));
        t.add(ConnId(2), PlayerId(3), "z", link(1));
        let ids = t.snapshot().into_iter().map(|c| c.conn_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![ConnId(1), ConnId(2), ConnId(3)]);
        assert_eq!(t.on_link(LinkId(1)), vec![ConnId(2), ConnId(3)]);
    }

    #[test]
    fn action_lookup_prefers_locale_then_focus() {
        let mut t = PlayerConns::new();
        t.add(ConnId(1), PlayerId(1), "x", link(1));
        let c = t.get_mut(ConnId(1)).unwrap();
        c.focus_actions.insert(
            "k".to_string(),
            Action::Focus {
                target: "focus".to_string(),
            },
        );
        c.populace_actions.insert(
            "p".to_string(),
            Action::Focus {
                target: "bob".to_string(),
            },
        );
        assert_eq!(
            c.find_action("k"),
            Some(&Action::Focus {
                target: "focus".to_string()
            })
        );
        c.locale_actions.insert(
            "k".to_string(),
            Action::Event {
                text: "boo".to_string(),
                otext: None,
            },
        );
        assert!(matches!(c.find_action("k"), Some(Action::Event { .. })));
        assert!(c.find_action("p").is_some());
        assert!(c.find_action("zz").is_none());
    }
}
