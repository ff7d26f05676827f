//! Every command the world server understands, and the one place they are registered.

use relayproto::PlayerId;

use crate::command::{Call, CmdFlags, Command, CommandError, Origin, Registry, RegistryError};
use crate::playconn::Connection;
use crate::store::{Destination, ScopeId, Store, WorldId};

mod meta;
mod player;
mod server;


pub fn define_commands() -> Result<Registry, RegistryError> {
    let mut r = Registry::new();
    let srv = CmdFlags::PLAYER.server();
    let plr = CmdFlags::PLAYER;

    r.register("connect", srv.no_store(), server::cmd_connect)?;
    r.register("disconnect", srv.no_store(), server::cmd_disconnect)?;
    r.register("checkdisconnected", srv.writes(), server::cmd_checkdisconnected)?;
    r.register("tovoid", srv.writes(), server::cmd_tovoid)?;
    r.register("logplayerconntable", srv.no_store(), server::cmd_logplayerconntable)?;
    r.register("connrefreshall", srv.writes(), server::cmd_connrefreshall)?;
    r.register("connupdateplist", srv, server::cmd_connupdateplist)?;
    r.register("portin", srv.writes(), server::cmd_portin)?;

    r.register("playeropen", plr.no_store().preconnection(), player::cmd_playeropen)?;
    r.register("playerclose", plr, player::cmd_playerclose)?;
    r.register("uiprefs", plr, player::cmd_uiprefs)?;
    r.register("portstart", plr.writes(), player::cmd_portstart)?;
    r.register("selfdesc", plr.writes(), player::cmd_selfdesc)?;
    r.register("say", plr, player::cmd_say)?;
    r.register("pose", plr, player::cmd_pose)?;
    r.register("action", plr.writes(), player::cmd_action)?;
    r.register("dropfocus", plr.writes(), player::cmd_dropfocus)?;

    r.register("meta", plr, meta::cmd_meta)?;
    r.register("meta_help", plr, meta::cmd_meta_help)?;
    r.register("meta_refresh", plr, meta::cmd_meta_refresh)?;
    r.register("meta_actionmaps", plr, meta::cmd_meta_actionmaps)?;
    r.register("meta_dependencies", plr, meta::cmd_meta_dependencies)?;
    r.register("meta_exception", plr, meta::cmd_meta_exception)?;
    r.register("meta_panic", plr, meta::cmd_meta_panic)?;
    r.register("meta_panicstart", plr, meta::cmd_meta_panicstart)?;
    r.register("meta_holler", plr, meta::cmd_meta_holler)?;

    Ok(r)
}

/// The registry handed a handler some other command.
fn mismatch(name: &'static str) -> CommandError {
    CommandError::Internal(anyhow::anyhow!("{name} handler called with another command"))
}

fn player_call(call: Call, name: &'static str) -> Result<(Connection, Command), CommandError> {
    let Call { cmd, origin } = call;
    match origin {
        Origin::Player(conn) => Ok((conn, cmd)),
        _ => Err(CommandError::Internal(anyhow::anyhow!(
            "{name} needs a player connection"
        ))),
    }
}

async fn player_name(db: &dyn Store, uid: PlayerId) -> Result<String, CommandError> {
    db.player(uid)
        .await?
        .map(|p| p.name)
        .ok_or_else(|| CommandError::error_message(format!("No such player: {uid}")))
}

/// The configured start world and location, entered in scope `scid`.
async fn start_destination(db: &dyn Store, scid: ScopeId) -> Result<Destination, CommandError> {
    let lockey = db
        .config_value("startworldloc")
        .await?
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| CommandError::error_message("No start location is configured."))?;
    let wid = db
        .config_value("startworldid")
        .await?
        .and_then(|v| v.as_u64())
        .map(WorldId)
        .ok_or_else(|| CommandError::error_message("No start world is configured."))?;
    let loc = db.location_by_key(wid, &lockey).await?.ok_or_else(|| {
        CommandError::error_message(format!("Start location {lockey:?} not found in world {wid}."))
    })?;
    Ok(Destination {
        wid,
        scid,
        locid: loc.id,
    })
}
