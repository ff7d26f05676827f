//! Command descriptors, decoded payloads and the name → descriptor registry.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use relayproto::msg::ResumedConn;
use relayproto::{ConnId, PlayerId};
use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::playconn::Connection;
use crate::relay::BrokerLink;
use crate::store::Destination;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CmdFlags {
    /// Sent by the broker or an internal timer, never by a player.
    pub isserver: bool,
    /// Runs even while the store is unavailable.
    pub noneedmongo: bool,
    /// Runs before any `Connection` exists; gets the raw link.
    pub preconnection: bool,
    /// Mutates persisted state.
    pub doeswrite: bool,
}

impl CmdFlags {
    pub const PLAYER: CmdFlags = CmdFlags {
        isserver: false,
        noneedmongo: false,
        preconnection: false,
        doeswrite: false,
    };

    pub const fn server(mut self) -> Self {
        self.isserver = true;
        self
    }

    pub const fn no_store(mut self) -> Self {
        self.noneedmongo = true;
        self
    }

    pub const fn preconnection(mut self) -> Self {
        self.preconnection = true;
        self
    }

    pub const fn writes(mut self) -> Self {
        self.doeswrite = true;
        self
    }
}

/// A decoded request. Field sets are checked here, before any handler runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    // Broker and timer commands.
    Connect {
        #[serde(default)]
        connections: Vec<ResumedConn>,
    },
    Disconnect,
    Checkdisconnected,
    Tovoid {
        uid: PlayerId,
        #[serde(default)]
        portin: bool,
        #[serde(default)]
        portto: Option<Destination>,
    },
    Logplayerconntable,
    Connrefreshall {
        connid: ConnId,
    },
    Connupdateplist {
        connid: ConnId,
    },
    Portin {
        uid: PlayerId,
    },

    // Player commands.
    Playeropen {
        uid: PlayerId,
        email: String,
    },
    Playerclose,
    Uiprefs {
        #[serde(default)]
        map: serde_json::Map<String, serde_json::Value>,
    },
    Meta {
        text: String,
    },
    MetaHelp {
        #[serde(default)]
        args: Vec<String>,
    },
    MetaRefresh {
        #[serde(default)]
        args: Vec<String>,
    },
    MetaActionmaps {
        #[serde(default)]
        args: Vec<String>,
    },
    MetaDependencies {
        #[serde(default)]
        args: Vec<String>,
    },
    MetaException {
        #[serde(default)]
        args: Vec<String>,
    },
    MetaPanic {
        #[serde(default)]
        args: Vec<String>,
    },
    MetaPanicstart {
        #[serde(default)]
        args: Vec<String>,
    },
    MetaHoller {
        #[serde(default)]
        args: Vec<String>,
    },
    Portstart,
    Selfdesc {
        #[serde(default)]
        pronoun: Option<String>,
        #[serde(default)]
        desc: Option<String>,
    },
    Say {
        text: String,
    },
    Pose {
        text: String,
    },
    Action {
        action: String,
    },
    Dropfocus,
}

impl Command {
    pub fn decode(payload: serde_json::Value) -> Result<Self, CommandError> {
        let name = relayproto::msg::command_name(&payload)
            .unwrap_or("?")
            .to_string();
        serde_json::from_value(payload).map_err(|e| CommandError::BadPayload {
            name,
            err: e.to_string(),
        })
    }

    pub fn to_payload(&self) -> serde_json::Value {
        // Serializing a plain enum of strings/ints/maps cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// User mistake; shown verbatim to the originator.
    #[error("{0}")]
    Message(String),
    /// "Should not happen" but recoverable; shown verbatim and logged loudly.
    #[error("{0}")]
    ErrorMessage(String),
    #[error("Unrecognized command: {0}")]
    Unrecognized(String),
    #[error("Malformed {name} command: {err}")]
    BadPayload { name: String, err: String },
    #[error("The {0} command is not available here.")]
    NotHere(String),
    #[error("The database is not available.")]
    NoStore,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CommandError {
    pub fn message(s: impl Into<String>) -> Self {
        CommandError::Message(s.into())
    }

    pub fn error_message(s: impl Into<String>) -> Self {
        CommandError::ErrorMessage(s.into())
    }
}

pub type CmdResult = Result<(), CommandError>;

/// Who a command came from, resolved by the dispatcher from its flags.
#[derive(Debug, Clone)]
pub enum Origin {
    /// Broker control plane or an internal timer.
    Server { link: Option<BrokerLink> },
    /// A player transport the world server does not know yet.
    Preconnection { link: BrokerLink, conn_id: ConnId },
    Player(Connection),
}

impl Origin {
    pub fn conn(&self) -> Option<&Connection> {
        match self {
            Origin::Player(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub cmd: Command,
    pub origin: Origin,
}

impl Call {
    /// The player connection, for handlers registered without `isserver`/`preconnection`.
    pub fn player(&self) -> Result<&Connection, CommandError> {
        self.origin.conn().ok_or_else(|| {
            CommandError::Internal(anyhow::anyhow!("player command without a connection"))
        })
    }
}

pub type Handler = for<'a> fn(&'a mut App, &'a mut Task, Call) -> BoxFuture<'a, CmdResult>;

pub struct CommandDef {
    pub name: &'static str,
    pub flags: CmdFlags,
    pub handler: Handler,
}

impl std::fmt::Debug for CommandDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDef")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("command name defined twice: {0:?}")]
    Duplicate(&'static str),
}

#[derive(Debug, Default)]
pub struct Registry {
    cmds: HashMap<&'static str, CommandDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &'static str,
        flags: CmdFlags,
        handler: Handler,
    ) -> Result<(), RegistryError> {
        if self.cmds.contains_key(name) {
            return Err(RegistryError::Duplicate(name));
        }
        self.cmds.insert(
            name,
            CommandDef {
                name,
                flags,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CommandDef> {
        self.cmds.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut v = self.cmds.keys().copied().collect::<Vec<_>>();
        v.sort();
        v
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }
}
