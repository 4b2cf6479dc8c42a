mod common;

use common::*;
use mumble_client::proto::mumble::{PermissionQuery, ServerConfig};
use mumble_client::{
    MumbleError, MumbleEvent, MumbleMessage, Recipients, VoiceTarget, WhisperTarget,
};

#[tokio::test]
async fn send_text_addresses_every_recipient_kind() {
    let (client, mut server) = connected().await;

    let recipients = Recipients {
        sessions: vec![OTHER_SESSION],
        channels: vec![LOBBY],
        trees: vec![0],
    };
    client.send_text("hi all", recipients).await.expect("sent");

    match server.recv_non_ping().await {
        MumbleMessage::TextMessage(msg) => {
            assert_eq!(msg.message, "hi all");
            assert_eq!(msg.session, [OTHER_SESSION]);
            assert_eq!(msg.channel_id, [LOBBY]);
            assert_eq!(msg.tree_id, [0]);
        }
        other => panic!("expected TextMessage, got {}", other.name()),
    }

    let err = client
        .send_text("nobody", Recipients::default())
        .await
        .expect_err("no recipients");
    assert!(matches!(err, MumbleError::Protocol(_)));
}

#[tokio::test]
async fn send_text_honors_the_server_length_limit() {
    let (client, mut server) = connected().await;
    let mut events = client.subscribe_events();

    server
        .send(MumbleMessage::ServerConfig(ServerConfig {
            message_length: Some(8),
            ..Default::default()
        }))
        .await;
    wait_for(&mut events, |e| {
        matches!(e, MumbleEvent::Generic(MumbleMessage::ServerConfig(_)))
    })
    .await;

    let err = client
        .send_text("far too long", Recipients::session(OTHER_SESSION))
        .await
        .expect_err("too long");
    assert!(matches!(err, MumbleError::Protocol(_)));
    client
        .send_text("short", Recipients::session(OTHER_SESSION))
        .await
        .expect("fits");
    assert!(matches!(
        server.recv_non_ping().await,
        MumbleMessage::TextMessage(msg) if msg.message == "short"
    ));
}

#[tokio::test]
async fn channel_moves_use_our_session() {
    let (client, mut server) = connected().await;

    client.join_channel(GAMES).await.expect("join");
    match server.recv_non_ping().await {
        MumbleMessage::UserState(state) => {
            assert_eq!(state.session, Some(SELF_SESSION));
            assert_eq!(state.channel_id, Some(GAMES));
        }
        other => panic!("expected UserState, got {}", other.name()),
    }

    client.join_path("AFK").await.expect("join by path");
    match server.recv_non_ping().await {
        MumbleMessage::UserState(state) => assert_eq!(state.channel_id, Some(AFK)),
        other => panic!("expected UserState, got {}", other.name()),
    }

    let err = client.join_path("Lobby/Nowhere").await.expect_err("no channel");
    assert!(matches!(err, MumbleError::Channel(_)));

    client.move_user(OTHER_SESSION, AFK).await.expect("move other");
    match server.recv_non_ping().await {
        MumbleMessage::UserState(state) => {
            assert_eq!(state.session, Some(OTHER_SESSION));
            assert_eq!(state.channel_id, Some(AFK));
        }
        other => panic!("expected UserState, got {}", other.name()),
    }
}

#[tokio::test]
async fn mute_and_deafen_requests() {
    let (client, mut server) = connected().await;

    client.set_self_deaf(true).await.expect("deafen");
    match server.recv_non_ping().await {
        MumbleMessage::UserState(state) => {
            assert_eq!(state.session, Some(SELF_SESSION));
            assert_eq!(state.self_deaf, Some(true));
            assert_eq!(state.self_mute, Some(true));
        }
        other => panic!("expected UserState, got {}", other.name()),
    }

    client.set_self_mute(false).await.expect("unmute");
    match server.recv_non_ping().await {
        MumbleMessage::UserState(state) => {
            assert_eq!(state.self_mute, Some(false));
            assert_eq!(state.self_deaf, None);
        }
        other => panic!("expected UserState, got {}", other.name()),
    }

    client.set_mute(OTHER_SESSION, true).await.expect("mute other");
    client.set_deaf(OTHER_SESSION, true).await.expect("deafen other");
    match server.recv_non_ping().await {
        MumbleMessage::UserState(state) => assert_eq!(state.mute, Some(true)),
        other => panic!("expected UserState, got {}", other.name()),
    }
    match server.recv_non_ping().await {
        MumbleMessage::UserState(state) => assert_eq!(state.deaf, Some(true)),
        other => panic!("expected UserState, got {}", other.name()),
    }
}

#[tokio::test]
async fn kick_and_ban_send_user_remove() {
    let (client, mut server) = connected().await;

    client.kick(OTHER_SESSION, Some("spam")).await.expect("kick");
    client.ban(OTHER_SESSION, None).await.expect("ban");

    match server.recv_non_ping().await {
        MumbleMessage::UserRemove(remove) => {
            assert_eq!(remove.session, OTHER_SESSION);
            assert_eq!(remove.reason.as_deref(), Some("spam"));
            assert_eq!(remove.ban, None);
        }
        other => panic!("expected UserRemove, got {}", other.name()),
    }
    match server.recv_non_ping().await {
        MumbleMessage::UserRemove(remove) => assert_eq!(remove.ban, Some(true)),
        other => panic!("expected UserRemove, got {}", other.name()),
    }
}

#[tokio::test]
async fn channel_management_requests() {
    let (client, mut server) = connected().await;

    client.create_channel(LOBBY, "Music", true).await.expect("create");
    match server.recv_non_ping().await {
        MumbleMessage::ChannelState(state) => {
            assert_eq!(state.channel_id, None);
            assert_eq!(state.parent, Some(LOBBY));
            assert_eq!(state.name.as_deref(), Some("Music"));
            assert_eq!(state.temporary, Some(true));
        }
        other => panic!("expected ChannelState, got {}", other.name()),
    }

    client.rename_channel(AFK, "Away").await.expect("rename");
    client.link_channels(LOBBY, AFK).await.expect("link");
    client.unlink_channels(LOBBY, AFK).await.expect("unlink");
    client.remove_channel(GAMES).await.expect("remove");

    match server.recv_non_ping().await {
        MumbleMessage::ChannelState(state) => {
            assert_eq!(state.channel_id, Some(AFK));
            assert_eq!(state.name.as_deref(), Some("Away"));
        }
        other => panic!("expected ChannelState, got {}", other.name()),
    }
    match server.recv_non_ping().await {
        MumbleMessage::ChannelState(state) => {
            assert_eq!(state.channel_id, Some(LOBBY));
            assert_eq!(state.links_add, [AFK]);
            assert!(state.links_remove.is_empty());
        }
        other => panic!("expected ChannelState, got {}", other.name()),
    }
    match server.recv_non_ping().await {
        MumbleMessage::ChannelState(state) => {
            assert_eq!(state.links_remove, [AFK]);
            assert!(state.links_add.is_empty());
        }
        other => panic!("expected ChannelState, got {}", other.name()),
    }
    assert!(matches!(
        server.recv_non_ping().await,
        MumbleMessage::ChannelRemove(remove) if remove.channel_id == GAMES
    ));

    let err = client.remove_channel(0).await.expect_err("root");
    assert!(matches!(err, MumbleError::Channel(_)));
    let err = client.move_channel(LOBBY, GAMES).await.expect_err("cycle");
    assert!(matches!(err, MumbleError::Channel(_)));
    client.move_channel(GAMES, AFK).await.expect("move");
    assert!(matches!(
        server.recv_non_ping().await,
        MumbleMessage::ChannelState(state)
            if state.channel_id == Some(GAMES) && state.parent == Some(AFK)
    ));
}

#[tokio::test]
async fn whisper_targets_are_registered() {
    let (client, mut server) = connected().await;

    let err = client
        .register_voice_target(0, Vec::new())
        .await
        .expect_err("id 0 is normal speech");
    assert!(matches!(err, MumbleError::InvalidConfig(_)));
    let err = client
        .register_voice_target(31, Vec::new())
        .await
        .expect_err("id 31 is loopback");
    assert!(matches!(err, MumbleError::InvalidConfig(_)));

    let target = client
        .register_voice_target(
            5,
            vec![
                WhisperTarget::Sessions(vec![OTHER_SESSION]),
                WhisperTarget::Channel {
                    id: LOBBY,
                    links: true,
                    children: false,
                    group: None,
                },
            ],
        )
        .await
        .expect("registered");
    assert_eq!(target, VoiceTarget::Whisper(5));

    match server.recv_non_ping().await {
        MumbleMessage::VoiceTarget(msg) => {
            assert_eq!(msg.id, Some(5));
            assert_eq!(msg.targets.len(), 2);
            assert_eq!(msg.targets[0].session, [OTHER_SESSION]);
            assert_eq!(msg.targets[1].channel_id, Some(LOBBY));
            assert_eq!(msg.targets[1].links, Some(true));
        }
        other => panic!("expected VoiceTarget, got {}", other.name()),
    }
}

#[tokio::test]
async fn channel_permissions_are_cached_or_queried() {
    let (client, mut server) = connected().await;

    // Root permissions arrived with ServerSync.
    assert_eq!(client.channel_permissions(0).await.expect("root"), 0x0f);

    let query = client.channel_permissions(GAMES);
    let answer = async {
        match server.recv_non_ping().await {
            MumbleMessage::PermissionQuery(query) => {
                assert_eq!(query.channel_id, Some(GAMES));
                server
                    .send(MumbleMessage::PermissionQuery(PermissionQuery {
                        channel_id: Some(GAMES),
                        permissions: Some(0x1),
                        flush: None,
                    }))
                    .await;
            }
            other => panic!("expected PermissionQuery, got {}", other.name()),
        }
    };
    let (permissions, ()) = tokio::join!(query, answer);
    assert_eq!(permissions.expect("answered"), 0x1);

    // Now cached.
    assert_eq!(client.channel_permissions(GAMES).await.expect("cached"), 0x1);

    let err = client.channel_permissions(99).await.expect_err("unknown");
    assert!(matches!(err, MumbleError::Channel(_)));
}

#[tokio::test]
async fn own_state_changes_surface_through_lookups() {
    use mumble_client::proto::mumble::UserState;

    let (client, mut server) = connected().await;
    let mut events = client.subscribe_events();
    wait_for(&mut events, |e| matches!(e, MumbleEvent::Ready { .. })).await;

    server
        .send(MumbleMessage::UserState(UserState {
            session: Some(SELF_SESSION),
            self_mute: Some(true),
            ..Default::default()
        }))
        .await;
    wait_for(&mut events, |e| {
        matches!(e, MumbleEvent::UserFlagChanged { session: SELF_SESSION, .. })
    })
    .await;

    let me = client.self_user().await.expect("self");
    assert!(me.self_mute);
    assert!(!me.can_talk());
    assert!(me.can_hear());
}
