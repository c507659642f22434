use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::Message;

const LOG_TAG: &str = "[Tandem Server]";

/// EMA weight for folding a new RTT sample into the smoothed estimate.
const LATENCY_ALPHA: f64 = 0.2;

/// Shared server state
#[derive(Clone, Default)]
pub struct ServerState {
    /// All active rooms: room_id -> Room
    pub rooms: Arc<DashMap<String, Room>>,
    /// All connected clients: client_id -> ClientInfo
    pub clients: Arc<DashMap<Uuid, ClientInfo>>,
    /// Room membership: room_id -> Vec<client_id>
    pub room_members: Arc<DashMap<String, Arc<RwLock<Vec<Uuid>>>>>,
}

/// Room state tracked by the server. At most one admin at a time; `playback`
/// stays `None` until the room has seen its first track.
#[derive(Debug, Clone, Default)]
pub struct Room {
    pub admin_id: Option<Uuid>,
    pub playback: Option<PlaybackState>,
}

/// Authoritative playback snapshot, mutated only by admin-originated events.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    pub video_id: String,
    pub position_secs: f64,
    pub is_playing: bool,
    pub autoplay: bool,
    /// Server receipt time of the last mutation; used to project the
    /// position forward for late joiners while playing.
    pub updated_at: Instant,
}

impl PlaybackState {
    fn for_video(video_id: String) -> Self {
        Self {
            video_id,
            position_secs: 0.0,
            is_playing: false,
            autoplay: false,
            updated_at: Instant::now(),
        }
    }

    pub fn projected_position(&self) -> f64 {
        if self.is_playing {
            self.position_secs + self.updated_at.elapsed().as_secs_f64()
        } else {
            self.position_secs
        }
    }
}

/// Client connection metadata
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub room_id: Option<String>,
    pub latency: LatencyEstimate,
    pub ping_sent_at: Option<Instant>,
}

/// Smoothed one-way latency: `estimate = estimate*(1-a) + (rtt/2)*a`.
/// The first sample is adopted directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyEstimate {
    one_way_secs: f64,
    primed: bool,
}

impl LatencyEstimate {
    pub fn record_rtt(&mut self, rtt: Duration) {
        let half = rtt.as_secs_f64() / 2.0;
        if self.primed {
            self.one_way_secs = self.one_way_secs * (1.0 - LATENCY_ALPHA) + half * LATENCY_ALPHA;
        } else {
            self.one_way_secs = half;
            self.primed = true;
        }
    }

    pub fn one_way(&self) -> Duration {
        Duration::from_secs_f64(self.one_way_secs.max(0.0))
    }
}

/// A state-changing event that only the room's admin may apply.
#[derive(Debug, Clone)]
pub enum AdminEvent {
    Seek { time: f64 },
    PlayPause { is_playing: bool },
    VideoChange { video_id: String },
    AutoplayChange { autoplay: bool },
    Heartbeat {
        time: f64,
        is_playing: bool,
        video_id: String,
        autoplay: bool,
    },
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&self, client_id: Uuid) {
        self.clients.insert(client_id, ClientInfo::default());
        tracing::info!("{LOG_TAG} Client {} connected", client_id);
    }

    pub async fn remove_client(&self, client_id: Uuid) {
        let _ = self.leave_room(client_id).await;
        self.clients.remove(&client_id);
        tracing::info!("{LOG_TAG} Client {} disconnected", client_id);
    }

    /// Bind a client to a room, creating the room if it does not exist.
    ///
    /// Admin is granted strictly first-writer-wins: the `wants_admin` claim
    /// only succeeds while the room has no admin. `seed_video` (from
    /// create_room) seeds the playback state when admin is granted. Returns
    /// the full-state push for the joining member, which is sent even when
    /// the room has no track yet.
    pub async fn join(
        &self,
        client_id: Uuid,
        room_id: &str,
        wants_admin: bool,
        seed_video: Option<String>,
    ) -> Message {
        let granted_admin;
        {
            let mut room = self.rooms.entry(room_id.to_string()).or_default();
            granted_admin = wants_admin && room.admin_id.is_none();
            if granted_admin {
                room.admin_id = Some(client_id);
                if room.playback.is_none() {
                    if let Some(video_id) = seed_video {
                        room.playback = Some(PlaybackState::for_video(video_id));
                    }
                }
            }
        }

        let members = {
            let entry = self
                .room_members
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Vec::new())));
            Arc::clone(&*entry)
        };
        {
            let mut members = members.write().await;
            if !members.contains(&client_id) {
                members.push(client_id);
            }
        }

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = Some(room_id.to_string());
        }

        tracing::info!(
            "{LOG_TAG} Client {} joined room {} as {}",
            client_id,
            room_id,
            if granted_admin { "admin" } else { "follower" }
        );
        self.snapshot_for(room_id, client_id)
    }

    pub async fn leave_room(&self, client_id: Uuid) -> Option<String> {
        let room_id = self.clients.get(&client_id).and_then(|c| c.room_id.clone())?;

        let members_lock = self.room_members.get(&room_id).map(|m| Arc::clone(&*m));
        if let Some(members_lock) = members_lock {
            let mut members = members_lock.write().await;
            members.retain(|id| *id != client_id);

            // Garbage-collect empty rooms
            if members.is_empty() {
                drop(members);
                self.room_members.remove(&room_id);
                self.rooms.remove(&room_id);
                if let Some(mut client) = self.clients.get_mut(&client_id) {
                    client.room_id = None;
                }
                tracing::info!("{LOG_TAG} Room {} deleted (empty)", room_id);
                return Some(room_id);
            }
        }

        // A leaving admin leaves the room adminless; there is no automatic
        // promotion, the room waits until it empties out.
        if let Some(mut room) = self.rooms.get_mut(&room_id) {
            if room.admin_id == Some(client_id) {
                room.admin_id = None;
                tracing::info!("{LOG_TAG} Room {} is now adminless", room_id);
            }
        }

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.room_id = None;
        }

        tracing::info!("{LOG_TAG} Client {} left room {}", client_id, room_id);
        Some(room_id)
    }

    /// Apply a state mutation if (and only if) `client_id` is the room's
    /// admin. Non-admin events are dropped without error: the client UI
    /// never emits them, so this is a defense-in-depth check.
    pub fn apply_admin_event(&self, room_id: &str, client_id: Uuid, event: AdminEvent) -> bool {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            tracing::debug!("{LOG_TAG} Event for unknown room {} dropped", room_id);
            return false;
        };
        if room.admin_id != Some(client_id) {
            tracing::debug!(
                "{LOG_TAG} Non-admin {} attempted {:?} in room {}",
                client_id,
                event,
                room_id
            );
            return false;
        }

        let now = Instant::now();
        match event {
            AdminEvent::Seek { time } => match room.playback.as_mut() {
                Some(playback) => {
                    playback.position_secs = time.max(0.0);
                    playback.updated_at = now;
                }
                None => return false,
            },
            AdminEvent::PlayPause { is_playing } => match room.playback.as_mut() {
                Some(playback) => {
                    playback.position_secs = playback.projected_position();
                    playback.is_playing = is_playing;
                    playback.updated_at = now;
                }
                None => return false,
            },
            AdminEvent::VideoChange { video_id } => {
                // New track replaces the state wholesale; position resets
                let autoplay = room.playback.as_ref().map(|p| p.autoplay).unwrap_or(false);
                let is_playing = room
                    .playback
                    .as_ref()
                    .map(|p| p.is_playing)
                    .unwrap_or(false);
                room.playback = Some(PlaybackState {
                    video_id,
                    position_secs: 0.0,
                    is_playing,
                    autoplay,
                    updated_at: now,
                });
            }
            AdminEvent::AutoplayChange { autoplay } => match room.playback.as_mut() {
                Some(playback) => {
                    playback.autoplay = autoplay;
                    playback.updated_at = now;
                }
                None => return false,
            },
            AdminEvent::Heartbeat {
                time,
                is_playing,
                video_id,
                autoplay,
            } => {
                room.playback = Some(PlaybackState {
                    video_id,
                    position_secs: time.max(0.0),
                    is_playing,
                    autoplay,
                    updated_at: now,
                });
            }
        }
        true
    }

    /// Full-state snapshot for one member, role included. Position is
    /// projected forward while playing so late joiners don't start a
    /// heartbeat interval behind.
    pub fn snapshot_for(&self, room_id: &str, client_id: Uuid) -> Message {
        let (playback, is_admin) = match self.rooms.get(room_id) {
            Some(room) => (room.playback.clone(), room.admin_id == Some(client_id)),
            None => (None, false),
        };

        match playback {
            Some(playback) => Message::RoomState {
                video_id: playback.video_id.clone(),
                current_time: playback.projected_position(),
                is_playing: playback.is_playing,
                autoplay: playback.autoplay,
                is_admin,
            },
            None => Message::RoomState {
                video_id: String::new(),
                current_time: 0.0,
                is_playing: false,
                autoplay: false,
                is_admin,
            },
        }
    }

    pub async fn get_room_members(&self, room_id: &str) -> Vec<Uuid> {
        if let Some(members_ref) = self.room_members.get(room_id) {
            let members_lock = Arc::clone(&*members_ref);
            drop(members_ref);
            let members = members_lock.read().await;
            members.clone()
        } else {
            Vec::new()
        }
    }

    pub fn room_of(&self, client_id: Uuid) -> Option<String> {
        self.clients.get(&client_id).and_then(|c| c.room_id.clone())
    }

    /// Record that a ping was just sent to this client.
    pub fn mark_ping(&self, client_id: Uuid) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.ping_sent_at = Some(Instant::now());
        }
    }

    /// Fold the pong for the outstanding ping into the member's estimate.
    pub fn record_pong(&self, client_id: Uuid) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            if let Some(sent_at) = client.ping_sent_at.take() {
                let rtt = sent_at.elapsed();
                client.latency.record_rtt(rtt);
                tracing::debug!(
                    "{LOG_TAG} Client {} rtt {:?}, one-way estimate {:?}",
                    client_id,
                    rtt,
                    client.latency.one_way()
                );
            }
        }
    }

    pub fn one_way_latency(&self, client_id: Uuid) -> Duration {
        self.clients
            .get(&client_id)
            .map(|c| c.latency.one_way())
            .unwrap_or_default()
    }
}
