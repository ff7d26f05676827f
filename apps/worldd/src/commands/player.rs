//! Commands a connected player sends, plus the admission handshake.

use futures_util::future::BoxFuture;
use relayproto::msg::Outbound;
use tracing::{error, info};

use super::{mismatch, player_call, player_name, start_destination};
use crate::app::App;
use crate::command::{Call, CmdResult, Command, CommandError, Origin};
use crate::playconn::{Action, Connection};
use crate::store::{PlayState, PlayStateUpdate, PlayerUpdate};
use crate::task::{Dirty, Task};

const PRONOUNS: [&str; 5] = ["he", "she", "it", "they", "name"];

pub(super) fn cmd_playeropen<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let Command::Playeropen { uid, email } = call.cmd else {
            return Err(mismatch("playeropen"));
        };
        let Origin::Preconnection { link, conn_id } = call.origin else {
            return Err(anyhow::anyhow!("playeropen with a connection already open").into());
        };

        if !app.store_available() {
            link.send_control(&Outbound::Playernotok {
                connid: conn_id,
                text: CommandError::NoStore.to_string(),
            });
            return Ok(());
        }

        app.conns.add(conn_id, uid, email.clone(), link.clone());
        link.send_control(&Outbound::Playerok { connid: conn_id });
        app.queue_command(Command::Connrefreshall { connid: conn_id }.to_payload(), None);
        info!(conn = %conn_id, uid = %uid, email = %email, "player has connected");
        // If the player is in the void, put them somewhere.
        app.queue_command(Command::Portin { uid }.to_payload(), None);
        Ok(())
    })
}

pub(super) fn cmd_playerclose<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let conn = call.player()?;
        info!(
            conn = %conn.conn_id,
            uid = %conn.uid,
            email = %conn.email,
            "player has disconnected"
        );
        if let Err(e) = app.conns.remove(conn.conn_id) {
            error!(conn = %conn.conn_id, err = %e, "failed to remove on playerclose");
        }
        Ok(())
    })
}

pub(super) fn cmd_uiprefs<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let (conn, cmd) = player_call(call, "uiprefs")?;
        let Command::Uiprefs { map } = cmd else {
            return Err(mismatch("uiprefs"));
        };
        let db = app.store()?;
        for (key, val) in map {
            db.set_playpref(conn.uid, &key, val).await?;
        }
        Ok(())
    })
}

pub(super) fn cmd_portstart<'a>(
    app: &'a mut App,
    _task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let uid = call.player()?.uid;
        let db = app.store()?;
        let player = db
            .player(uid)
            .await?
            .ok_or_else(|| CommandError::error_message(format!("No such player: {uid}")))?;
        // The start world, which is not necessarily where a panic or login lands.
        let dest = start_destination(&*db, player.scid).await?;
        app.queue_command(
            Command::Tovoid {
                uid,
                portin: true,
                portto: Some(dest),
            }
            .to_payload(),
            None,
        );
        Ok(())
    })
}

pub(super) fn cmd_selfdesc<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let (conn, cmd) = player_call(call, "selfdesc")?;
        let Command::Selfdesc { pronoun, desc } = cmd else {
            return Err(mismatch("selfdesc"));
        };
        let db = app.store()?;

        if let Some(pronoun) = pronoun.filter(|p| !p.is_empty()) {
            if !PRONOUNS.contains(&pronoun.as_str()) {
                return Err(CommandError::error_message(format!(
                    "Invalid pronoun: {pronoun}"
                )));
            }
            db.update_player(
                conn.uid,
                PlayerUpdate {
                    pronoun: Some(pronoun),
                    ..Default::default()
                },
            )
            .await?;
            task.set_data_change("players", conn.uid.0, "pronoun");
        }
        if let Some(desc) = desc.filter(|d| !d.is_empty()) {
            db.update_player(
                conn.uid,
                PlayerUpdate {
                    desc: Some(desc),
                    ..Default::default()
                },
            )
            .await?;
            task.set_data_change("players", conn.uid.0, "desc");
        }
        Ok(())
    })
}

fn speech_verbs(text: &str) -> (&'static str, &'static str) {
    if text.ends_with('?') {
        ("ask", "asks")
    } else if text.ends_with('!') {
        ("exclaim", "exclaims")
    } else {
        ("say", "says")
    }
}

pub(super) fn cmd_say<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let (conn, cmd) = player_call(call, "say")?;
        let Command::Say { text } = cmd else {
            return Err(mismatch("say"));
        };
        let db = app.store()?;
        let name = player_name(&*db, conn.uid).await?;

        let (say, says) = speech_verbs(&text);
        task.write_event(&app.conns, [conn.uid], &format!("You {say}, \"{text}\""));
        let others = task.find_locale_players(&*db, conn.uid, true).await?;
        if !others.is_empty() {
            task.write_event(&app.conns, others, &format!("{name} {says}, \"{text}\""));
        }
        Ok(())
    })
}

pub(super) fn cmd_pose<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let (conn, cmd) = player_call(call, "pose")?;
        let Command::Pose { text } = cmd else {
            return Err(mismatch("pose"));
        };
        let db = app.store()?;
        let name = player_name(&*db, conn.uid).await?;
        let everyone = task.find_locale_players(&*db, conn.uid, false).await?;
        task.write_event(&app.conns, everyone, &format!("{name} {text}"));
        Ok(())
    })
}

pub(super) fn cmd_action<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let (conn, cmd) = player_call(call, "action")?;
        let Command::Action { action } = cmd else {
            return Err(mismatch("action"));
        };
        // Only what the player's client currently shows may be performed.
        let Some(act) = conn.find_action(&action).cloned() else {
            return Err(CommandError::error_message("Action is not available."));
        };
        perform_action(app, task, &conn, act).await
    })
}

async fn perform_action(app: &App, task: &mut Task, conn: &Connection, act: Action) -> CmdResult {
    let db = app.store()?;
    let uid = conn.uid;
    match act {
        Action::Focus { target } => {
            db.update_playstate(
                uid,
                PlayStateUpdate {
                    focus: Some(Some(target)),
                    ..Default::default()
                },
            )
            .await?;
            task.set_dirty([uid], Dirty::FOCUS);
            task.set_data_change("playstate", uid.0, "focus");
        }
        Action::Event { text, otext } => {
            task.write_event(&app.conns, [uid], &text);
            if let Some(otext) = otext {
                let others = task.find_locale_players(&*db, uid, true).await?;
                if !others.is_empty() {
                    task.write_event(&app.conns, others, &otext);
                }
            }
        }
        Action::Move { loc, text } => {
            let ps = db.playstate(uid).await?.unwrap_or_else(|| PlayState::void(uid));
            let Some((iid, oldloc)) = ps.locale() else {
                return Err(CommandError::message("You are not anywhere."));
            };
            let inst = db
                .instance(iid)
                .await?
                .ok_or_else(|| CommandError::error_message(format!("No such instance: {iid}")))?;
            let dest = db
                .location(loc)
                .await?
                .filter(|l| l.wid == inst.wid)
                .ok_or_else(|| CommandError::error_message("That way leads nowhere."))?;
            let name = player_name(&*db, uid).await?;

            if let Some(text) = text {
                task.write_event(&app.conns, [uid], &text);
            }
            let left = task.find_locale_players(&*db, uid, true).await?;
            if !left.is_empty() {
                task.set_dirty(left.iter().copied(), Dirty::POPULACE);
                task.write_event(&app.conns, left, &format!("{name} leaves."));
            }

            db.update_playstate(
                uid,
                PlayStateUpdate {
                    locid: Some(Some(dest.id)),
                    focus: Some(None),
                    lastmoved: Some(task.start),
                    ..Default::default()
                },
            )
            .await?;
            task.set_dirty([uid], Dirty::FOCUS | Dirty::LOCALE | Dirty::POPULACE);
            task.set_data_change("playstate", uid.0, "locid");
            task.set_data_change("populace", iid.0, oldloc.to_string());
            task.set_data_change("populace", iid.0, dest.id.to_string());

            // The pinned locale is the old room now.
            task.clear_locale(uid);
            let joined = task.find_locale_players(&*db, uid, true).await?;
            if !joined.is_empty() {
                task.set_dirty(joined.iter().copied(), Dirty::POPULACE);
                task.write_event(&app.conns, joined, &format!("{name} arrives."));
            }
        }
    }
    Ok(())
}

pub(super) fn cmd_dropfocus<'a>(
    app: &'a mut App,
    task: &'a mut Task,
    call: Call,
) -> BoxFuture<'a, CmdResult> {
    Box::pin(async move {
        let uid = call.player()?.uid;
        let db = app.store()?;
        db.update_playstate(
            uid,
            PlayStateUpdate {
                focus: Some(None),
                ..Default::default()
            },
        )
        .await?;
        task.set_dirty([uid], Dirty::FOCUS);
        task.set_data_change("playstate", uid.0, "focus");
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use relayproto::ConnId;
    use serde_json::json;

    use super::*;
    use crate::store::{LocationId, Store};
    use crate::testutil::{events_for, Fixture, ALICE, BOB, HALL, START};

    #[tokio::test]
    async fn say_picks_the_verb_and_reaches_the_room() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.attach(ConnId(12), BOB);
        fx.portin(ALICE).await;
        fx.portin(BOB).await;
        fx.sent();

        fx.run(ConnId(11), json!({"cmd": "say", "text": "Hello?"}))
            .await;
        let sent = fx.sent();
        assert_eq!(events_for(&sent, ConnId(11)), vec![r#"You ask, "Hello?""#]);
        assert_eq!(events_for(&sent, ConnId(12)), vec![r#"Alice asks, "Hello?""#]);

        assert_eq!(speech_verbs("Hi!"), ("exclaim", "exclaims"));
        assert_eq!(speech_verbs("Hi."), ("say", "says"));
    }

    #[tokio::test]
    async fn say_in_the_void_is_heard_only_by_the_speaker() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.attach(ConnId(12), BOB);

        fx.run(ConnId(11), json!({"cmd": "say", "text": "anyone"}))
            .await;
        let sent = fx.sent();
        assert_eq!(events_for(&sent, ConnId(11)), vec![r#"You say, "anyone""#]);
        assert!(events_for(&sent, ConnId(12)).is_empty());
    }

    #[tokio::test]
    async fn pose_includes_the_poser() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.attach(ConnId(12), BOB);
        fx.portin(ALICE).await;
        fx.portin(BOB).await;
        fx.sent();

        fx.run(ConnId(12), json!({"cmd": "pose", "text": "waves."}))
            .await;
        let sent = fx.sent();
        assert_eq!(events_for(&sent, ConnId(11)), vec!["Bob waves."]);
        assert_eq!(events_for(&sent, ConnId(12)), vec!["Bob waves."]);
    }

    #[tokio::test]
    async fn playeropen_admits_and_queues_portin() {
        let mut fx = Fixture::new().await;
        fx.run(
            ConnId(11),
            json!({"cmd": "playeropen", "uid": ALICE.0, "email": "alice@example.com"}),
        )
        .await;
        assert_eq!(
            fx.sent(),
            vec![(ConnId::CONTROL, Outbound::Playerok { connid: ConnId(11) })]
        );
        assert_eq!(fx.app.conns.get(ConnId(11)).unwrap().uid, ALICE);

        let queued = fx.queued();
        assert_eq!(queued[0]["cmd"], "connrefreshall");
        assert_eq!(queued[1], json!({"cmd": "portin", "uid": ALICE.0}));
    }

    #[tokio::test]
    async fn playeropen_is_refused_while_the_store_is_away() {
        let mut fx = Fixture::new().await;
        fx.take_store();
        fx.run(
            ConnId(11),
            json!({"cmd": "playeropen", "uid": ALICE.0, "email": "alice@example.com"}),
        )
        .await;
        assert_eq!(
            fx.sent(),
            vec![(
                ConnId::CONTROL,
                Outbound::Playernotok {
                    connid: ConnId(11),
                    text: "The database is not available.".to_string()
                }
            )]
        );
        assert!(fx.app.conns.is_empty());
        assert!(fx.queued().is_empty());

        fx.restore_store();
        fx.run(
            ConnId(11),
            json!({"cmd": "playeropen", "uid": ALICE.0, "email": "alice@example.com"}),
        )
        .await;
        assert_eq!(fx.app.conns.len(), 1);
    }

    #[tokio::test]
    async fn playerclose_forgets_the_connection() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.attach(ConnId(12), ALICE);
        fx.run(ConnId(11), json!({"cmd": "playerclose"})).await;
        assert_eq!(fx.app.conns.count_for_player(ALICE), 1);
        assert!(fx.app.conns.get(ConnId(11)).is_none());
    }

    #[tokio::test]
    async fn selfdesc_validates_the_pronoun() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);

        fx.run(ConnId(11), json!({"cmd": "selfdesc", "pronoun": "xe"}))
            .await;
        assert_eq!(
            fx.sent(),
            vec![(
                ConnId(11),
                Outbound::Error {
                    text: "Invalid pronoun: xe".to_string()
                }
            )]
        );

        let out = fx
            .run(
                ConnId(11),
                json!({"cmd": "selfdesc", "pronoun": "they", "desc": "A tall figure."}),
            )
            .await
            .unwrap();
        assert!(out.has_change("players", ALICE.0, "pronoun"));
        assert!(out.has_change("players", ALICE.0, "desc"));
        let p = fx.db.player(ALICE).await.unwrap().unwrap();
        assert_eq!(p.pronoun.as_deref(), Some("they"));
        assert_eq!(p.desc.as_deref(), Some("A tall figure."));
    }

    #[tokio::test]
    async fn uiprefs_are_upserted() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.run(ConnId(11), json!({"cmd": "uiprefs", "map": {"font": "serif"}}))
            .await;
        fx.run(ConnId(11), json!({"cmd": "uiprefs", "map": {"font": "mono", "size": 3}}))
            .await;
        let mut prefs = fx.db.playprefs(ALICE).await;
        prefs.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(prefs.len(), 2);
        assert_eq!(prefs[0].val, json!("mono"));
        assert_eq!(prefs[1].val, json!(3));
    }

    #[tokio::test]
    async fn portstart_queues_a_trip_through_the_void() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.run(ConnId(11), json!({"cmd": "portstart"})).await;
        assert_eq!(
            fx.queued(),
            vec![json!({
                "cmd": "tovoid",
                "uid": ALICE.0,
                "portin": true,
                "portto": {"wid": 1, "scid": 5, "locid": START.0}
            })]
        );
    }

    #[tokio::test]
    async fn unlisted_actions_are_refused() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.run(ConnId(11), json!({"cmd": "action", "action": "xyzzy"}))
            .await;
        assert_eq!(
            fx.sent(),
            vec![(
                ConnId(11),
                Outbound::Error {
                    text: "Action is not available.".to_string()
                }
            )]
        );
    }

    #[tokio::test]
    async fn focus_action_sets_focus_and_dropfocus_clears_it() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.portin(ALICE).await;
        fx.app.conns.get_mut(ConnId(11)).unwrap().locale_actions.insert(
            "look".to_string(),
            Action::Focus {
                target: "fountain".to_string(),
            },
        );

        let out = fx
            .run(ConnId(11), json!({"cmd": "action", "action": "look"}))
            .await
            .unwrap();
        assert_eq!(out.dirty_for(ALICE), Dirty::FOCUS);
        assert_eq!(fx.playstate(ALICE).await.focus.as_deref(), Some("fountain"));

        fx.run(ConnId(11), json!({"cmd": "dropfocus"})).await;
        assert_eq!(fx.playstate(ALICE).await.focus, None);
    }

    #[tokio::test]
    async fn move_action_walks_between_rooms() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.attach(ConnId(12), BOB);
        fx.portin(ALICE).await;
        fx.portin(BOB).await;
        fx.sent();
        fx.app.conns.get_mut(ConnId(11)).unwrap().locale_actions.insert(
            "north".to_string(),
            Action::Move {
                loc: HALL,
                text: Some("You walk north.".to_string()),
            },
        );

        let out = fx
            .run(ConnId(11), json!({"cmd": "action", "action": "north"}))
            .await
            .unwrap();
        assert_eq!(fx.playstate(ALICE).await.locid, Some(HALL));
        assert_eq!(
            out.dirty_for(ALICE),
            Dirty::FOCUS | Dirty::LOCALE | Dirty::POPULACE
        );
        assert_eq!(out.dirty_for(BOB), Dirty::POPULACE);
        let iid = fx.playstate(ALICE).await.iid.unwrap();
        assert!(out.has_change("populace", iid.0, &START.to_string()));
        assert!(out.has_change("populace", iid.0, &HALL.to_string()));

        let sent = fx.sent();
        assert_eq!(events_for(&sent, ConnId(11)), vec!["You walk north."]);
        assert_eq!(events_for(&sent, ConnId(12)), vec!["Alice leaves."]);

        // Bob follows and Alice sees him arrive.
        fx.app.conns.get_mut(ConnId(12)).unwrap().locale_actions.insert(
            "north".to_string(),
            Action::Move {
                loc: HALL,
                text: None,
            },
        );
        fx.run(ConnId(12), json!({"cmd": "action", "action": "north"}))
            .await;
        let sent = fx.sent();
        assert_eq!(events_for(&sent, ConnId(11)), vec!["Bob arrives."]);
        assert!(events_for(&sent, ConnId(12)).is_empty());
    }

    #[tokio::test]
    async fn move_to_another_world_is_refused() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.portin(ALICE).await;
        fx.app.conns.get_mut(ConnId(11)).unwrap().locale_actions.insert(
            "jump".to_string(),
            Action::Move {
                loc: LocationId(999),
                text: None,
            },
        );
        fx.sent();
        fx.run(ConnId(11), json!({"cmd": "action", "action": "jump"}))
            .await;
        assert!(matches!(&fx.sent()[0].1, Outbound::Error { .. }));
        assert_eq!(fx.playstate(ALICE).await.locid, Some(START));
    }

    #[tokio::test]
    async fn event_action_narrates_to_self_and_others() {
        let mut fx = Fixture::new().await;
        fx.attach(ConnId(11), ALICE);
        fx.attach(ConnId(12), BOB);
        fx.portin(ALICE).await;
        fx.portin(BOB).await;
        fx.sent();
        fx.app.conns.get_mut(ConnId(11)).unwrap().focus_actions.insert(
            "poke".to_string(),
            Action::Event {
                text: "You poke the fountain.".to_string(),
                otext: Some("Alice pokes the fountain.".to_string()),
            },
        );
        fx.run(ConnId(11), json!({"cmd": "action", "action": "poke"}))
            .await;
        let sent = fx.sent();
        assert_eq!(events_for(&sent, ConnId(11)), vec!["You poke the fountain."]);
        assert_eq!(events_for(&sent, ConnId(12)), vec!["Alice pokes the fountain."]);
    }
}
