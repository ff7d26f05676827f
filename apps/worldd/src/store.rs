//! Persisted collections and the store interface the handlers talk to.
//!
//! The store may vanish at runtime; see `monitor` for how a live handle is
//! published and withdrawn.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relayproto::PlayerId;
use serde::{Deserialize, Serialize};

macro_rules! doc_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

doc_id!(WorldId);
doc_id!(ScopeId);
doc_id!(InstanceId);
doc_id!(LocationId);
doc_id!(PortalId);
doc_id!(PortalListId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Visitor,
    Member,
    Staff,
    Owner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub scid: ScopeId,
    pub plistid: PortalListId,
    #[serde(default)]
    pub pronoun: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
}

/// Where a player goes when they next leave the void.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub wid: WorldId,
    pub scid: ScopeId,
    pub locid: LocationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayState {
    pub id: PlayerId,
    #[serde(default)]
    pub iid: Option<InstanceId>,
    #[serde(default)]
    pub locid: Option<LocationId>,
    #[serde(default)]
    pub focus: Option<String>,
    #[serde(default)]
    pub portto: Option<Destination>,
    #[serde(default)]
    pub lastmoved: Option<DateTime<Utc>>,
}

impl PlayState {
    pub fn void(id: PlayerId) -> Self {
        Self {
            id,
            iid: None,
            locid: None,
            focus: None,
            portto: None,
            lastmoved: None,
        }
    }

    /// `(instance, location)` when the player stands somewhere; `None` in the void.
    pub fn locale(&self) -> Option<(InstanceId, LocationId)> {
        match (self.iid, self.locid) {
            (Some(i), Some(l)) => Some((i, l)),
            _ => None,
        }
    }
}

/// Field-wise `$set` on a playstate. `None` leaves the field alone.
#[derive(Debug, Clone, Default)]
pub struct PlayStateUpdate {
    pub iid: Option<Option<InstanceId>>,
    pub locid: Option<Option<LocationId>>,
    pub focus: Option<Option<String>>,
    pub portto: Option<Option<Destination>>,
    pub lastmoved: Option<DateTime<Utc>>,
}

impl PlayStateUpdate {
    pub fn apply(self, ps: &mut PlayState) {
        if let Some(v) = self.iid {
            ps.iid = v;
        }
        if let Some(v) = self.locid {
            ps.locid = v;
        }
        if let Some(v) = self.focus {
            ps.focus = v;
        }
        if let Some(v) = self.portto {
            ps.portto = v;
        }
        if let Some(v) = self.lastmoved {
            ps.lastmoved = Some(v);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerUpdate {
    pub pronoun: Option<String>,
    pub desc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub wid: WorldId,
    pub scid: ScopeId,
    #[serde(default)]
    pub minaccess: Access,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub wid: WorldId,
    pub key: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    pub id: WorldId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub id: ScopeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portal {
    pub id: PortalId,
    pub plistid: PortalListId,
    #[serde(default)]
    pub listpos: i64,
    pub wid: WorldId,
    pub scid: ScopeId,
    pub locid: LocationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeAccess {
    pub uid: PlayerId,
    pub scid: ScopeId,
    pub level: Access,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub val: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayPref {
    pub uid: PlayerId,
    pub key: String,
    pub val: serde_json::Value,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Cheap liveness probe. `Ok(false)` and `Err` both mean "gone".
    async fn ping(&self) -> anyhow::Result<bool>;

    async fn player(&self, uid: PlayerId) -> anyhow::Result<Option<Player>>;
    async fn update_player(&self, uid: PlayerId, upd: PlayerUpdate) -> anyhow::Result<()>;

    async fn playstate(&self, uid: PlayerId) -> anyhow::Result<Option<PlayState>>;
    async fn update_playstate(&self, uid: PlayerId, upd: PlayStateUpdate) -> anyhow::Result<()>;
    /// Players whose playstate names an instance.
    async fn in_world(&self) -> anyhow::Result<Vec<PlayerId>>;
    async fn players_at(&self, iid: InstanceId, locid: LocationId) -> anyhow::Result<Vec<PlayerId>>;

    async fn config_value(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;

    async fn location(&self, id: LocationId) -> anyhow::Result<Option<Location>>;
    async fn location_by_key(&self, wid: WorldId, key: &str) -> anyhow::Result<Option<Location>>;
    async fn world(&self, id: WorldId) -> anyhow::Result<Option<World>>;
    async fn scope(&self, id: ScopeId) -> anyhow::Result<Option<Scope>>;

    async fn instance(&self, id: InstanceId) -> anyhow::Result<Option<Instance>>;
    async fn instance_for(&self, wid: WorldId, scid: ScopeId) -> anyhow::Result<Option<Instance>>;
    /// Find-or-create the instance for `(wid, scid)`. The bool is true when this call created it.
    async fn create_instance(&self, wid: WorldId, scid: ScopeId)
        -> anyhow::Result<(Instance, bool)>;

    async fn scope_access(&self, uid: PlayerId, scid: ScopeId) -> anyhow::Result<Access>;

    async fn portals(&self, plistid: PortalListId) -> anyhow::Result<Vec<Portal>>;

    async fn set_playpref(
        &self,
        uid: PlayerId,
        key: &str,
        val: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Opens fresh store handles for the monitor.
#[async_trait::async_trait]
pub trait StoreConnector: Send + Sync {
    async fn open(&self) -> anyhow::Result<Arc<dyn Store>>;
}
