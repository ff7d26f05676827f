use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use relayproto::PlayerId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::store::{
    Access, ConfigEntry, Instance, InstanceId, Location, LocationId, PlayPref, PlayState,
    PlayStateUpdate, Player, PlayerUpdate, Portal, PortalListId, Scope, ScopeAccess, ScopeId,
    Store, StoreConnector, World, WorldId,
};

/// Every collection, in the shape of the snapshot file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collections {
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(default)]
    pub playstate: Vec<PlayState>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub worlds: Vec<World>,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub scopeaccess: Vec<ScopeAccess>,
    #[serde(default)]
    pub portals: Vec<Portal>,
    #[serde(default)]
    pub config: Vec<ConfigEntry>,
    #[serde(default)]
    pub playprefs: Vec<PlayPref>,
}

impl Collections {
    fn next_instance_id(&self) -> InstanceId {
        let max = self.instances.iter().map(|i| i.id.0).max().unwrap_or(0);
        InstanceId(max + 1)
    }
}

/// In-memory document store, optionally mirrored to a JSON snapshot file.
#[derive(Debug)]
pub struct MemStore {
    data: Mutex<Collections>,
    backing: Option<PathBuf>,
}

impl MemStore {
    #[cfg(test)]
    pub fn new(data: Collections) -> Self {
        Self {
            data: Mutex::new(data),
            backing: None,
        }
    }

    pub fn with_backing(data: Collections, path: PathBuf) -> Self {
        Self {
            data: Mutex::new(data),
            backing: Some(path),
        }
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> Collections {
        self.data.lock().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn edit(&self, f: impl FnOnce(&mut Collections)) {
        f(&mut *self.data.lock().await);
    }

    #[cfg(test)]
    pub async fn playprefs(&self, uid: PlayerId) -> Vec<PlayPref> {
        let d = self.data.lock().await;
        d.playprefs.iter().filter(|p| p.uid == uid).cloned().collect()
    }

    /// Run `f` on a copy of the collections and make the copy current only once
    /// it has been saved.
    async fn commit<T>(
        &self,
        f: impl FnOnce(&mut Collections) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut d = self.data.lock().await;
        let mut next = d.clone();
        let out = f(&mut next)?;
        self.save(&next).await?;
        *d = next;
        Ok(out)
    }

    async fn save(&self, data: &Collections) -> anyhow::Result<()> {
        let Some(path) = &self.backing else {
            return Ok(());
        };
        let s = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, s)
            .await
            .with_context(|| format!("write store snapshot {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("replace store snapshot {}", path.display()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn ping(&self) -> anyhow::Result<bool> {
        match &self.backing {
            Some(path) => Ok(tokio::fs::try_exists(path).await?),
            None => Ok(true),
        }
    }

    async fn player(&self, uid: PlayerId) -> anyhow::Result<Option<Player>> {
        let d = self.data.lock().await;
        Ok(d.players.iter().find(|p| p.id == uid).cloned())
    }

    async fn update_player(&self, uid: PlayerId, upd: PlayerUpdate) -> anyhow::Result<()> {
        self.commit(|d| {
            let p = d
                .players
                .iter_mut()
                .find(|p| p.id == uid)
                .with_context(|| format!("no player {uid}"))?;
            if let Some(v) = upd.pronoun {
                p.pronoun = Some(v);
            }
            if let Some(v) = upd.desc {
                p.desc = Some(v);
            }
            Ok(())
        })
        .await
    }

    async fn playstate(&self, uid: PlayerId) -> anyhow::Result<Option<PlayState>> {
        let d = self.data.lock().await;
        Ok(d.playstate.iter().find(|p| p.id == uid).cloned())
    }

    async fn update_playstate(&self, uid: PlayerId, upd: PlayStateUpdate) -> anyhow::Result<()> {
        self.commit(|d| {
            match d.playstate.iter().position(|p| p.id == uid) {
                Some(i) => upd.apply(&mut d.playstate[i]),
                None => {
                    let mut ps = PlayState::void(uid);
                    upd.apply(&mut ps);
                    d.playstate.push(ps);
                }
            }
            Ok(())
        })
        .await
    }

    async fn in_world(&self) -> anyhow::Result<Vec<PlayerId>> {
        let d = self.data.lock().await;
        Ok(d
            .playstate
            .iter()
            .filter(|p| p.iid.is_some())
            .map(|p| p.id)
            .collect())
    }

    async fn players_at(
        &self,
        iid: InstanceId,
        locid: LocationId,
    ) -> anyhow::Result<Vec<PlayerId>> {
        let d = self.data.lock().await;
        Ok(d
            .playstate
            .iter()
            .filter(|p| p.iid == Some(iid) && p.locid == Some(locid))
            .map(|p| p.id)
            .collect())
    }

    async fn config_value(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        let d = self.data.lock().await;
        Ok(d.config.iter().find(|c| c.key == key).map(|c| c.val.clone()))
    }

    async fn location(&self, id: LocationId) -> anyhow::Result<Option<Location>> {
        let d = self.data.lock().await;
        Ok(d.locations.iter().find(|l| l.id == id).cloned())
    }

    async fn location_by_key(&self, wid: WorldId, key: &str) -> anyhow::Result<Option<Location>> {
        let d = self.data.lock().await;
        Ok(d
            .locations
            .iter()
            .find(|l| l.wid == wid && l.key == key)
            .cloned())
    }

    async fn world(&self, id: WorldId) -> anyhow::Result<Option<World>> {
        let d = self.data.lock().await;
        Ok(d.worlds.iter().find(|w| w.id == id).cloned())
    }

    async fn scope(&self, id: ScopeId) -> anyhow::Result<Option<Scope>> {
        let d = self.data.lock().await;
        Ok(d.scopes.iter().find(|s| s.id == id).cloned())
    }

    async fn instance(&self, id: InstanceId) -> anyhow::Result<Option<Instance>> {
        let d = self.data.lock().await;
        Ok(d.instances.iter().find(|i| i.id == id).cloned())
    }

    async fn instance_for(&self, wid: WorldId, scid: ScopeId) -> anyhow::Result<Option<Instance>> {
        let d = self.data.lock().await;
        Ok(d
            .instances
            .iter()
            .find(|i| i.wid == wid && i.scid == scid)
            .cloned())
    }

    async fn create_instance(
        &self,
        wid: WorldId,
        scid: ScopeId,
    ) -> anyhow::Result<(Instance, bool)> {
        // Lookup and insert share one critical section: (wid, scid) stays unique.
        let mut d = self.data.lock().await;
        if let Some(i) = d.instances.iter().find(|i| i.wid == wid && i.scid == scid) {
            return Ok((i.clone(), false));
        }
        let inst = Instance {
            id: d.next_instance_id(),
            wid,
            scid,
            minaccess: Access::Visitor,
        };
        let mut next = d.clone();
        next.instances.push(inst.clone());
        self.save(&next).await?;
        *d = next;
        Ok((inst, true))
    }

    async fn scope_access(&self, uid: PlayerId, scid: ScopeId) -> anyhow::Result<Access> {
        let d = self.data.lock().await;
        Ok(d
            .scopeaccess
            .iter()
            .find(|a| a.uid == uid && a.scid == scid)
            .map(|a| a.level)
            .unwrap_or_default())
    }

    async fn portals(&self, plistid: PortalListId) -> anyhow::Result<Vec<Portal>> {
        let d = self.data.lock().await;
        Ok(d
            .portals
            .iter()
            .filter(|p| p.plistid == plistid)
            .cloned()
            .collect())
    }

    async fn set_playpref(
        &self,
        uid: PlayerId,
        key: &str,
        val: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.commit(|d| {
            match d
                .playprefs
                .iter()
                .position(|p| p.uid == uid && p.key == key)
            {
                Some(i) => d.playprefs[i].val = val,
                None => d.playprefs.push(PlayPref {
                    uid,
                    key: key.to_string(),
                    val,
                }),
            }
            Ok(())
        })
        .await
    }
}

/// Opens a `MemStore` from the snapshot file at `path`.
///
/// A missing or unreadable file counts as "store unavailable"; deleting the file
/// under a live server makes the next probe fail.
#[derive(Debug, Clone)]
pub struct FileConnector {
    path: PathBuf,
}

impl FileConnector {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl StoreConnector for FileConnector {
    async fn open(&self) -> anyhow::Result<Arc<dyn Store>> {
        let s = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read store snapshot {}", self.path.display()))?;
        let data: Collections = serde_json::from_str(&s)
            .with_context(|| format!("parse store snapshot {}", self.path.display()))?;
        info!(
            path = %self.path.display(),
            players = data.players.len(),
            instances = data.instances.len(),
            "store snapshot loaded"
        );
        Ok(Arc::new(MemStore::with_backing(data, self.path.clone())))
    }
}
