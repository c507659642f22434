use serde::{Deserialize, Serialize};

/// Messages sent between client and server (must match server protocol).
///
/// Internally tagged JSON: snake_case `type` tags with camelCase fields,
/// e.g. `{"type":"seek","roomId":"r1","time":42.0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    // Client -> Server
    CreateRoom {
        room_id: String,
        video_id: String,
    },
    JoinRoom {
        room_id: String,
        is_admin: bool,
    },
    LeaveRoom {
        room_id: String,
    },
    SyncRequest {
        room_id: String,
    },

    // Admin -> Server, re-broadcast to every other room member
    Seek {
        room_id: String,
        time: f64,
    },
    PlayPause {
        room_id: String,
        is_playing: bool,
    },
    VideoChange {
        room_id: String,
        video_id: String,
    },
    AutoplayChange {
        room_id: String,
        autoplay: bool,
    },
    /// Periodic full-state heartbeat. Emitted by the admin while playing,
    /// fanned out by the server to every other member.
    SyncResponse {
        room_id: String,
        time: f64,
        is_playing: bool,
        video_id: String,
        autoplay: bool,
    },

    // Server -> Client
    /// Full snapshot pushed on join and on sync_request. `video_id` is empty
    /// while the room has no track yet. `is_admin` is the server-assigned
    /// role for the receiving member.
    RoomState {
        video_id: String,
        current_time: f64,
        is_playing: bool,
        autoplay: bool,
        is_admin: bool,
    },

    // Bidirectional RTT probe
    Ping,
    Pong,
}
