use tokio::sync::mpsc;
use uuid::Uuid;

use tandem_server::protocol::Message;
use tandem_server::ws::{handle_message, AppState};

async fn register_client(state: &AppState) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
    let client_id = Uuid::new_v4();
    state.coordinator.add_client(client_id);
    let (tx, rx) = mpsc::unbounded_channel();
    state.client_senders.write().await.insert(client_id, tx);
    (client_id, rx)
}

async fn dispatch(state: &AppState, client_id: Uuid, msg: &Message) {
    let text = serde_json::to_string(msg).unwrap();
    handle_message(&text, client_id, state).await.unwrap();
}

#[tokio::test]
async fn late_join_receives_state_push_before_any_heartbeat() {
    let state = AppState::default();
    let (admin, mut admin_rx) = register_client(&state).await;

    dispatch(
        &state,
        admin,
        &Message::CreateRoom {
            room_id: "r1".to_string(),
            video_id: "vid-a".to_string(),
        },
    )
    .await;
    assert!(matches!(
        admin_rx.try_recv().unwrap(),
        Message::RoomState { is_admin: true, .. }
    ));

    dispatch(
        &state,
        admin,
        &Message::SyncResponse {
            room_id: "r1".to_string(),
            time: 17.0,
            is_playing: true,
            video_id: "vid-a".to_string(),
            autoplay: false,
        },
    )
    .await;

    let (follower, mut follower_rx) = register_client(&state).await;
    dispatch(
        &state,
        follower,
        &Message::JoinRoom {
            room_id: "r1".to_string(),
            is_admin: false,
        },
    )
    .await;

    // The very first message a joiner sees is the full snapshot
    match follower_rx.try_recv().unwrap() {
        Message::RoomState {
            video_id,
            current_time,
            is_playing,
            is_admin,
            ..
        } => {
            assert_eq!(video_id, "vid-a");
            assert!(current_time >= 17.0);
            assert!(is_playing);
            assert!(!is_admin);
        }
        other => panic!("expected room_state, got {:?}", other),
    }
}

#[tokio::test]
async fn admin_claim_of_second_joiner_is_not_honored() {
    let state = AppState::default();
    let (first, mut first_rx) = register_client(&state).await;
    let (second, mut second_rx) = register_client(&state).await;

    dispatch(
        &state,
        first,
        &Message::JoinRoom {
            room_id: "abc".to_string(),
            is_admin: true,
        },
    )
    .await;
    dispatch(
        &state,
        second,
        &Message::JoinRoom {
            room_id: "abc".to_string(),
            is_admin: true,
        },
    )
    .await;

    assert!(matches!(
        first_rx.try_recv().unwrap(),
        Message::RoomState { is_admin: true, .. }
    ));
    assert!(matches!(
        second_rx.try_recv().unwrap(),
        Message::RoomState { is_admin: false, .. }
    ));
}

#[tokio::test]
async fn broadcast_reaches_followers_but_not_the_originator() {
    let state = AppState::default();
    let (admin, mut admin_rx) = register_client(&state).await;
    let (follower, mut follower_rx) = register_client(&state).await;

    dispatch(
        &state,
        admin,
        &Message::CreateRoom {
            room_id: "r1".to_string(),
            video_id: "vid-a".to_string(),
        },
    )
    .await;
    dispatch(
        &state,
        follower,
        &Message::JoinRoom {
            room_id: "r1".to_string(),
            is_admin: false,
        },
    )
    .await;
    let _ = admin_rx.try_recv();
    let _ = follower_rx.try_recv();

    dispatch(
        &state,
        admin,
        &Message::Seek {
            room_id: "r1".to_string(),
            time: 42.0,
        },
    )
    .await;

    // No latency samples yet, so the biased target equals the original
    match follower_rx.try_recv().unwrap() {
        Message::Seek { time, .. } => assert_eq!(time, 42.0),
        other => panic!("expected seek, got {:?}", other),
    }
    assert!(admin_rx.try_recv().is_err());
}

#[tokio::test]
async fn follower_mutations_are_dropped_silently() {
    let state = AppState::default();
    let (admin, mut admin_rx) = register_client(&state).await;
    let (follower, mut follower_rx) = register_client(&state).await;

    dispatch(
        &state,
        admin,
        &Message::CreateRoom {
            room_id: "r1".to_string(),
            video_id: "vid-a".to_string(),
        },
    )
    .await;
    dispatch(
        &state,
        follower,
        &Message::JoinRoom {
            room_id: "r1".to_string(),
            is_admin: false,
        },
    )
    .await;
    let _ = admin_rx.try_recv();
    let _ = follower_rx.try_recv();

    dispatch(
        &state,
        follower,
        &Message::PlayPause {
            room_id: "r1".to_string(),
            is_playing: true,
        },
    )
    .await;

    // Nothing broadcast, nothing mutated
    assert!(admin_rx.try_recv().is_err());
    assert!(follower_rx.try_recv().is_err());
    match state.coordinator.snapshot_for("r1", follower) {
        Message::RoomState { is_playing, .. } => assert!(!is_playing),
        other => panic!("expected room_state, got {:?}", other),
    }
}

#[tokio::test]
async fn sync_request_answers_with_current_snapshot() {
    let state = AppState::default();
    let (admin, mut admin_rx) = register_client(&state).await;
    let (follower, mut follower_rx) = register_client(&state).await;

    dispatch(
        &state,
        admin,
        &Message::CreateRoom {
            room_id: "r1".to_string(),
            video_id: "vid-a".to_string(),
        },
    )
    .await;
    dispatch(
        &state,
        follower,
        &Message::JoinRoom {
            room_id: "r1".to_string(),
            is_admin: false,
        },
    )
    .await;
    let _ = admin_rx.try_recv();
    let _ = follower_rx.try_recv();

    dispatch(
        &state,
        follower,
        &Message::SyncRequest {
            room_id: "r1".to_string(),
        },
    )
    .await;
    match follower_rx.try_recv().unwrap() {
        Message::RoomState { video_id, .. } => assert_eq!(video_id, "vid-a"),
        other => panic!("expected room_state, got {:?}", other),
    }
}

#[tokio::test]
async fn former_admin_loses_write_access_after_leaving() {
    let state = AppState::default();
    let (admin, mut admin_rx) = register_client(&state).await;
    let (follower, mut follower_rx) = register_client(&state).await;

    dispatch(
        &state,
        admin,
        &Message::CreateRoom {
            room_id: "r1".to_string(),
            video_id: "vid-a".to_string(),
        },
    )
    .await;
    dispatch(
        &state,
        follower,
        &Message::JoinRoom {
            room_id: "r1".to_string(),
            is_admin: false,
        },
    )
    .await;
    let _ = admin_rx.try_recv();
    let _ = follower_rx.try_recv();

    dispatch(
        &state,
        admin,
        &Message::LeaveRoom {
            room_id: "r1".to_string(),
        },
    )
    .await;

    // The room survives adminless; the old admin's events no longer apply
    dispatch(
        &state,
        admin,
        &Message::Seek {
            room_id: "r1".to_string(),
            time: 5.0,
        },
    )
    .await;
    assert!(follower_rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_and_unknown_messages_are_rejected_not_fatal() {
    let state = AppState::default();
    let (client, _rx) = register_client(&state).await;

    assert!(handle_message("not json at all", client, &state).await.is_err());
    assert!(handle_message(r#"{"type":"bogus"}"#, client, &state)
        .await
        .is_err());
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let state = AppState::default();
    let (client, mut rx) = register_client(&state).await;

    dispatch(&state, client, &Message::Ping).await;
    assert_eq!(rx.try_recv().unwrap(), Message::Pong);
}
