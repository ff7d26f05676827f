//! Slash commands. `meta` parses the line and re-queues the `meta_<word>` command.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use relayproto::msg::Outbound;
use serde_json::json;
use tracing::{info, warn};

use super::{mismatch, player_call};
use crate::app::App;
use crate::command::{Call, CmdResult, Command, CommandError};
use crate::playconn::{Action, Connection};
use crate::task::Task;

pub(super) fn cmd_meta<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let (conn, cmd) = player_call(call, "meta")?;
        let Command::Meta { text } = cmd else {
            return Err(mismatch("meta"));
        };
        let words = text.split_whitespace().collect::<Vec<_>>();
        let Some((key, rest)) = words.split_first() else {
            return Err(CommandError::message(
                "You must supply a command after the slash. Try \u{201C}/help\u{201D}.",
            ));
        };
        let name = format!("meta_{key}");
        if app.registry().get(&name).is_none() {
            return Err(CommandError::message(format!(
                "Command \u{201C}/{key}\u{201D} not understood. Try \u{201C}/help\u{201D}."
            )));
        }
        app.queue_command(json!({"cmd": name, "args": rest}), Some(conn.conn_id));
        Ok(())
    })
}

pub(super) fn cmd_meta_help<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let conn = call.player()?;
        let slash = app
            .registry()
            .names()
            .into_iter()
            .filter_map(|n| n.strip_prefix("meta_"))
            .map(|n| format!("/{n}"))
            .collect::<Vec<_>>();
        conn.write(&Outbound::Message {
            text: format!("Slash commands: {}", slash.join(", ")),
        });
        Ok(())
    })
}

pub(super) fn cmd_meta_refresh<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let conn = call.player()?;
        conn.write(&Outbound::Message {
            text: "Refreshing display...".to_string(),
        });
        app.queue_command(
            Command::Connrefreshall {
                connid: conn.conn_id,
            }
            .to_payload(),
            None,
        );
        Ok(())
    })
}

fn sorted(map: &std::collections::HashMap<String, Action>) -> String {
    let m = map.iter().collect::<BTreeMap<_, _>>();
    serde_json::to_string(&m).unwrap_or_default()
}

fn tell(conn: &Connection, text: String) {
    conn.write(&Outbound::Message { text });
}

pub(super) fn cmd_meta_actionmaps<'a>(
    _app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let conn = call.player()?;
        tell(conn, format!("Locale action map: {}", sorted(&conn.locale_actions)));
        tell(conn, format!("Populace action map: {}", sorted(&conn.populace_actions)));
        tell(conn, format!("Focus action map: {}", sorted(&conn.focus_actions)));
        Ok(())
    })
}

pub(super) fn cmd_meta_dependencies<'a>(
    _app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let conn = call.player()?;
        let join = |s: &std::collections::BTreeSet<String>| {
            s.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
        };
        tell(conn, format!("Locale dependency set: {{{}}}", join(&conn.locale_dependencies)));
        tell(conn, format!("Populace dependency set: {{{}}}", join(&conn.populace_dependencies)));
        tell(conn, format!("Focus dependency set: {{{}}}", join(&conn.focus_dependencies)));
        Ok(())
    })
}

pub(super) fn cmd_meta_exception<'a>(
    _app: &'a mut App,
    _task: &'a mut Task,
    _call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move { Err(anyhow::anyhow!("You asked for an exception.").into()) })
}

pub(super) fn cmd_meta_panic<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let uid = call.player()?.uid;
        app.queue_command(
            Command::Tovoid {
                uid,
                portin: true,
                portto: None,
            }
            .to_payload(),
            None,
        );
        Ok(())
    })
}

pub(super) fn cmd_meta_panicstart<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let conn_id = call.player()?.conn_id;
        app.queue_command(Command::Portstart.to_payload(), Some(conn_id));
        Ok(())
    })
}

pub(super) fn cmd_meta_holler<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let (conn, cmd) = player_call(call, "meta_holler")?;
        let Command::MetaHoller { args } = cmd else {
            return Err(mismatch("meta_holler"));
        };
        if !app.cfg.is_admin(&conn.email) {
            warn!(uid = %conn.uid, email = %conn.email, "holler refused");
            return Err(CommandError::message("Only administrators may holler."));
        }
        let text = format!("Admin broadcast: {}", args.join(" "));
        info!(uid = %conn.uid, links = app.links.len(), text = %text, "holler");
        for link in app.links.values() {
            link.send_control(&Outbound::Messageall { text: text.clone() });
        }
        Ok(())
    })
}
