use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::Message;
use crate::state::{AdminEvent, ServerState};

/// Interval between server-originated latency probes per connection.
const PING_INTERVAL: Duration = Duration::from_secs(12);

pub type ClientSender = mpsc::UnboundedSender<Message>;
pub type ClientSenders = Arc<RwLock<HashMap<Uuid, ClientSender>>>;

#[derive(Clone, Default)]
pub struct AppState {
    pub coordinator: ServerState,
    pub client_senders: ClientSenders,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/websocket", get(ws_endpoint))
        .with_state(state)
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_check() -> &'static str {
    "ok"
}

pub async fn handle_connection(socket: WebSocket, state: AppState) {
    let coordinator = state.coordinator.clone();
    let client_senders = state.client_senders.clone();
    let client_id = Uuid::new_v4();
    coordinator.add_client(client_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Register client sender
    client_senders.write().await.insert(client_id, tx.clone());

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    // Periodic latency probe; the pong folds into this member's estimate
    let ping_state = coordinator.clone();
    let ping_tx = tx.clone();
    let ping_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(PING_INTERVAL).await;
            ping_state.mark_ping(client_id);
            if ping_tx.send(Message::Ping).is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) = handle_message(&text, client_id, &state).await {
                    // Malformed input never takes down the dispatcher
                    tracing::warn!("Ignoring message from {}: {}", client_id, e);
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    client_senders.write().await.remove(&client_id);
    coordinator.remove_client(client_id).await;
    ping_task.abort();
    send_task.abort();
}

pub async fn handle_message(text: &str, client_id: Uuid, state: &AppState) -> anyhow::Result<()> {
    let msg: Message = serde_json::from_str(text)?;

    match msg {
        Message::CreateRoom { room_id, video_id } => {
            let push = state
                .coordinator
                .join(client_id, &room_id, true, Some(video_id))
                .await;
            send_to(state, client_id, push).await;
        }

        Message::JoinRoom { room_id, is_admin } => {
            // The wire flag is a request; the coordinator assigns the role
            // first-writer-wins and reports it in the state push.
            let push = state
                .coordinator
                .join(client_id, &room_id, is_admin, None)
                .await;
            send_to(state, client_id, push).await;
        }

        Message::LeaveRoom { room_id } => {
            let left = state.coordinator.leave_room(client_id).await;
            if left.as_deref() != Some(room_id.as_str()) {
                tracing::debug!(
                    "Client {} sent leave_room for {} while bound to {:?}",
                    client_id,
                    room_id,
                    left
                );
            }
        }

        Message::SyncRequest { room_id } => {
            let push = state.coordinator.snapshot_for(&room_id, client_id);
            send_to(state, client_id, push).await;
        }

        Message::Seek { room_id, time } => {
            if state
                .coordinator
                .apply_admin_event(&room_id, client_id, AdminEvent::Seek { time })
            {
                broadcast_seek(state, &room_id, client_id, time).await;
            }
        }

        Message::PlayPause {
            room_id,
            is_playing,
        } => {
            if state.coordinator.apply_admin_event(
                &room_id,
                client_id,
                AdminEvent::PlayPause { is_playing },
            ) {
                let message = Message::PlayPause {
                    room_id: room_id.clone(),
                    is_playing,
                };
                broadcast_to_room(state, &room_id, client_id, message).await;
            }
        }

        Message::VideoChange { room_id, video_id } => {
            if state.coordinator.apply_admin_event(
                &room_id,
                client_id,
                AdminEvent::VideoChange {
                    video_id: video_id.clone(),
                },
            ) {
                let message = Message::VideoChange {
                    room_id: room_id.clone(),
                    video_id,
                };
                broadcast_to_room(state, &room_id, client_id, message).await;
            }
        }

        Message::AutoplayChange { room_id, autoplay } => {
            if state.coordinator.apply_admin_event(
                &room_id,
                client_id,
                AdminEvent::AutoplayChange { autoplay },
            ) {
                let message = Message::AutoplayChange {
                    room_id: room_id.clone(),
                    autoplay,
                };
                broadcast_to_room(state, &room_id, client_id, message).await;
            }
        }

        Message::SyncResponse {
            room_id,
            time,
            is_playing,
            video_id,
            autoplay,
        } => {
            if state.coordinator.apply_admin_event(
                &room_id,
                client_id,
                AdminEvent::Heartbeat {
                    time,
                    is_playing,
                    video_id: video_id.clone(),
                    autoplay,
                },
            ) {
                let message = Message::SyncResponse {
                    room_id: room_id.clone(),
                    time,
                    is_playing,
                    video_id,
                    autoplay,
                };
                broadcast_to_room(state, &room_id, client_id, message).await;
            }
        }

        Message::Ping => {
            send_to(state, client_id, Message::Pong).await;
        }

        Message::Pong => {
            state.coordinator.record_pong(client_id);
        }

        Message::RoomState { .. } => {
            tracing::warn!("Unexpected room_state from client {}", client_id);
        }
    }

    Ok(())
}

/// FIFO fan-out to every room member except the originator.
pub async fn broadcast_to_room(
    state: &AppState,
    room_id: &str,
    from_client: Uuid,
    message: Message,
) {
    let members = state.coordinator.get_room_members(room_id).await;
    let senders = state.client_senders.read().await;

    tracing::debug!(
        "Broadcasting {:?} from {} to {} members in room {}",
        message,
        from_client,
        members.len(),
        room_id
    );

    for member_id in members {
        if member_id == from_client {
            continue;
        }
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(message.clone());
        }
    }
}

/// Seek fan-out with the target biased by each member's one-way latency.
async fn broadcast_seek(state: &AppState, room_id: &str, from_client: Uuid, time: f64) {
    let members = state.coordinator.get_room_members(room_id).await;
    let senders = state.client_senders.read().await;

    for member_id in members {
        if member_id == from_client {
            continue;
        }
        let biased = time + state.coordinator.one_way_latency(member_id).as_secs_f64();
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(Message::Seek {
                room_id: room_id.to_string(),
                time: biased,
            });
        }
    }
}

async fn send_to(state: &AppState, client_id: Uuid, message: Message) {
    if let Some(tx) = state.client_senders.read().await.get(&client_id) {
        let _ = tx.send(message);
    }
}
