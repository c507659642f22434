use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::sleep};

use crate::connection::RoomConnection;
use crate::constants::{
    CORRECTION_WINDOW, DRIFT_THRESHOLD_SECS, MAX_PLAYBACK_RATE, MAX_SYNC_INTERVAL,
    MIN_PLAYBACK_RATE, MIN_SYNC_INTERVAL,
};
use crate::protocol::Message;
use crate::transport::MediaTransport;

/// Player-level happenings the embedding layer cares about: resolving
/// media for a new track, reflecting the assigned role, transport state.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    RoleAssigned { is_admin: bool },
    TrackChanged { video_id: String },
    PlaybackToggled { is_playing: bool },
}

#[derive(Debug, Clone, Default)]
struct PlaybackView {
    room_id: Option<String>,
    video_id: String,
    is_playing: bool,
    autoplay: bool,
    is_admin: bool,
}

/// Keeps a local media transport aligned with the room's authoritative
/// playback state, and (as admin) publishes that state. Wire every server
/// message into [`RoomPlayer::handle_message`]; user gestures go through
/// the mutation methods, which are no-ops for followers.
pub struct RoomPlayer<T: MediaTransport + 'static> {
    inner: Arc<PlayerInner<T>>,
}

impl<T: MediaTransport + 'static> Clone for RoomPlayer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PlayerInner<T: MediaTransport + 'static> {
    conn: Arc<RoomConnection>,
    transport: Arc<T>,
    state: Mutex<PlaybackView>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    correction: Mutex<Option<JoinHandle<()>>>,
    on_event: Option<Box<dyn Fn(PlayerEvent) + Send + Sync>>,
}

impl<T: MediaTransport + 'static> RoomPlayer<T> {
    pub fn new(conn: Arc<RoomConnection>, transport: Arc<T>) -> Self {
        Self::build(conn, transport, None)
    }

    pub fn with_events(
        conn: Arc<RoomConnection>,
        transport: Arc<T>,
        on_event: impl Fn(PlayerEvent) + Send + Sync + 'static,
    ) -> Self {
        Self::build(conn, transport, Some(Box::new(on_event)))
    }

    fn build(
        conn: Arc<RoomConnection>,
        transport: Arc<T>,
        on_event: Option<Box<dyn Fn(PlayerEvent) + Send + Sync>>,
    ) -> Self {
        Self {
            inner: Arc::new(PlayerInner {
                conn,
                transport,
                state: Mutex::new(PlaybackView::default()),
                heartbeat: Mutex::new(None),
                correction: Mutex::new(None),
                on_event,
            }),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.inner.state.lock().is_admin
    }

    pub fn current_video(&self) -> String {
        self.inner.state.lock().video_id.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().is_playing
    }

    /// Bind to a room. Followers immediately ask for the current state so
    /// they can render without waiting for the next heartbeat.
    pub fn join(&self, room_id: &str, wants_admin: bool) {
        self.inner.state.lock().room_id = Some(room_id.to_string());
        self.inner.conn.send(Message::JoinRoom {
            room_id: room_id.to_string(),
            is_admin: wants_admin,
        });
        if !wants_admin {
            self.inner.conn.send(Message::SyncRequest {
                room_id: room_id.to_string(),
            });
        }
    }

    /// Create a room seeded with a default track, requesting admin.
    pub fn create(&self, room_id: &str, video_id: &str) {
        self.inner.state.lock().room_id = Some(room_id.to_string());
        self.inner.conn.send(Message::CreateRoom {
            room_id: room_id.to_string(),
            video_id: video_id.to_string(),
        });
    }

    pub fn leave(&self) {
        let room_id = self.inner.state.lock().room_id.take();
        if let Some(room_id) = room_id {
            self.inner.conn.send(Message::LeaveRoom { room_id });
        }
        *self.inner.state.lock() = PlaybackView::default();
        self.inner.stop_timers();
    }

    // ---- user gestures: authoritative mutations when admin, no-ops otherwise

    pub fn toggle_play_pause(&self) {
        let (room_id, next) = {
            let mut state = self.inner.state.lock();
            if !state.is_admin {
                return;
            }
            let Some(room_id) = state.room_id.clone() else {
                return;
            };
            state.is_playing = !state.is_playing;
            (room_id, state.is_playing)
        };
        self.inner.apply_transport_playing(next);
        self.inner.conn.send(Message::PlayPause {
            room_id,
            is_playing: next,
        });
        self.inner.refresh_heartbeat();
        self.inner.emit(PlayerEvent::PlaybackToggled { is_playing: next });
    }

    pub fn seek_to(&self, position_secs: f64) {
        let room_id = {
            let state = self.inner.state.lock();
            if !state.is_admin {
                return;
            }
            let Some(room_id) = state.room_id.clone() else {
                return;
            };
            room_id
        };
        if let Err(e) = self.inner.transport.seek(position_secs) {
            tracing::warn!("Transport seek failed: {}", e);
        }
        self.inner.conn.send(Message::Seek {
            room_id,
            time: position_secs,
        });
    }

    pub fn change_video(&self, video_id: &str) {
        let room_id = {
            let state = self.inner.state.lock();
            if !state.is_admin {
                return;
            }
            let Some(room_id) = state.room_id.clone() else {
                return;
            };
            room_id
        };
        self.inner.apply_track_change(video_id);
        self.inner.conn.send(Message::VideoChange {
            room_id,
            video_id: video_id.to_string(),
        });
    }

    pub fn set_autoplay(&self, autoplay: bool) {
        let room_id = {
            let mut state = self.inner.state.lock();
            if !state.is_admin {
                return;
            }
            let Some(room_id) = state.room_id.clone() else {
                return;
            };
            state.autoplay = autoplay;
            room_id
        };
        self.inner.conn.send(Message::AutoplayChange { room_id, autoplay });
    }

    /// Wire-in point: hand every server message here.
    pub fn handle_message(&self, message: Message) {
        let is_admin = self.inner.state.lock().is_admin;
        match message {
            // Discrete events are ground truth for followers
            Message::Seek { time, .. } => {
                if !is_admin {
                    if let Err(e) = self.inner.transport.seek(time) {
                        tracing::warn!("Transport seek failed: {}", e);
                    }
                }
            }
            Message::PlayPause { is_playing, .. } => {
                if !is_admin {
                    self.inner.adopt_playing(is_playing);
                }
            }
            Message::VideoChange { video_id, .. } => {
                self.inner.apply_track_change(&video_id);
            }
            Message::AutoplayChange { autoplay, .. } => {
                if !is_admin {
                    self.inner.state.lock().autoplay = autoplay;
                }
            }
            Message::SyncResponse {
                time,
                is_playing,
                video_id,
                autoplay,
                ..
            } => {
                if !is_admin {
                    self.inner.reconcile(time, is_playing, &video_id, autoplay);
                }
            }
            Message::RoomState {
                video_id,
                current_time,
                is_playing,
                autoplay,
                is_admin,
            } => {
                self.inner
                    .adopt_room_state(&video_id, current_time, is_playing, autoplay, is_admin);
            }
            // Probes are answered at the connection layer
            Message::Ping | Message::Pong => {}
            Message::CreateRoom { .. }
            | Message::JoinRoom { .. }
            | Message::LeaveRoom { .. }
            | Message::SyncRequest { .. } => {
                tracing::warn!("Unexpected client-bound message: {:?}", message);
            }
        }
    }
}

impl<T: MediaTransport + 'static> PlayerInner<T> {
    fn emit(&self, event: PlayerEvent) {
        if let Some(on_event) = &self.on_event {
            on_event(event);
        }
    }

    fn apply_transport_playing(&self, playing: bool) {
        let result = if playing {
            self.transport.play()
        } else {
            self.transport.pause()
        };
        if let Err(e) = result {
            tracing::warn!(
                "Transport {} failed: {}",
                if playing { "play" } else { "pause" },
                e
            );
        }
    }

    fn adopt_playing(self: &Arc<Self>, playing: bool) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.is_playing != playing;
            state.is_playing = playing;
            changed
        };
        self.apply_transport_playing(playing);
        self.refresh_heartbeat();
        if changed {
            self.emit(PlayerEvent::PlaybackToggled {
                is_playing: playing,
            });
        }
    }

    fn apply_track_change(self: &Arc<Self>, video_id: &str) {
        {
            let mut state = self.state.lock();
            if state.video_id == video_id {
                return;
            }
            state.video_id = video_id.to_string();
        }
        // New track starts from the top
        if let Err(e) = self.transport.seek(0.0) {
            tracing::warn!("Transport seek failed: {}", e);
        }
        self.emit(PlayerEvent::TrackChanged {
            video_id: video_id.to_string(),
        });
    }

    fn adopt_room_state(
        self: &Arc<Self>,
        video_id: &str,
        current_time: f64,
        is_playing: bool,
        autoplay: bool,
        is_admin: bool,
    ) {
        let role_changed = {
            let mut state = self.state.lock();
            let role_changed = state.is_admin != is_admin;
            state.is_admin = is_admin;
            state.autoplay = autoplay;
            role_changed
        };
        if role_changed {
            self.emit(PlayerEvent::RoleAssigned { is_admin });
        }

        // An empty video id means the room is waiting for its admin;
        // there is nothing to align yet
        if !video_id.is_empty() {
            self.apply_track_change(video_id);
            if let Err(e) = self.transport.seek(current_time) {
                tracing::warn!("Transport seek failed: {}", e);
            }
            self.adopt_playing(is_playing);
        }
        self.refresh_heartbeat();
    }

    /// Heartbeat reconciliation: latency-compensated hard seek for large
    /// drift, bounded rate nudge for small drift. Transport flags are
    /// adopted unconditionally.
    fn reconcile(self: &Arc<Self>, time: f64, is_playing: bool, video_id: &str, autoplay: bool) {
        if !video_id.is_empty() {
            self.apply_track_change(video_id);
        }

        let latency = self.conn.latency().as_secs_f64();
        let server_time = time + latency;
        match self.transport.position_secs() {
            Ok(local) => {
                let drift = server_time - local;
                if drift.abs() > DRIFT_THRESHOLD_SECS {
                    // A visible jump beats seconds of audible pitch slew
                    if let Err(e) = self.transport.seek(server_time) {
                        tracing::warn!("Transport seek failed: {}", e);
                    }
                } else {
                    let window = CORRECTION_WINDOW.as_secs_f64();
                    let rate =
                        (1.0 + drift / window).clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE);
                    if let Err(e) = self.transport.set_rate(rate) {
                        tracing::warn!("Transport rate change failed: {}", e);
                    }
                    self.schedule_rate_reset();
                }
            }
            Err(e) => tracing::warn!("Transport position unavailable: {}", e),
        }

        self.state.lock().autoplay = autoplay;
        self.adopt_playing(is_playing);
    }

    /// Re-arm the correction window. Any in-flight reset is replaced so a
    /// burst of heartbeats cannot leave a stale timer behind.
    fn schedule_rate_reset(self: &Arc<Self>) {
        let mut guard = self.correction.lock();
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        let weak = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            sleep(CORRECTION_WINDOW).await;
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.transport.set_rate(1.0) {
                    tracing::warn!("Transport rate reset failed: {}", e);
                }
            }
        }));
    }

    /// (Re)start or stop the admin heartbeat to match the current state.
    /// The previous task is always aborted, so role changes, pausing, and
    /// teardown never leak a timer.
    fn refresh_heartbeat(self: &Arc<Self>) {
        let should_run = {
            let state = self.state.lock();
            state.is_admin && state.is_playing && state.room_id.is_some()
        };
        let mut guard = self.heartbeat.lock();
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        if !should_run {
            return;
        }

        let weak = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(inner) => heartbeat_interval(inner.conn.latency()),
                    None => break,
                };
                sleep(interval).await;

                let Some(inner) = weak.upgrade() else { break };
                let (room_id, video_id, is_playing, autoplay) = {
                    let state = inner.state.lock();
                    let Some(room_id) = state.room_id.clone() else {
                        break;
                    };
                    if !(state.is_admin && state.is_playing) {
                        break;
                    }
                    (room_id, state.video_id.clone(), state.is_playing, state.autoplay)
                };
                let time = match inner.transport.position_secs() {
                    Ok(time) => time,
                    Err(e) => {
                        tracing::warn!("Transport position unavailable: {}", e);
                        continue;
                    }
                };
                inner.conn.send(Message::SyncResponse {
                    room_id,
                    time,
                    is_playing,
                    video_id,
                    autoplay,
                });
            }
        }));
    }

    fn stop_timers(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.correction.lock().take() {
            handle.abort();
        }
    }
}

impl<T: MediaTransport + 'static> Drop for PlayerInner<T> {
    fn drop(&mut self) {
        self.stop_timers();
    }
}

/// Heartbeat cadence scales with measured latency, clamped to sane bounds.
pub fn heartbeat_interval(latency: Duration) -> Duration {
    (latency * 4).clamp(MIN_SYNC_INTERVAL, MAX_SYNC_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COMMAND_THROTTLE;
    use crate::transport::SimulatedTransport;

    fn player() -> (RoomPlayer<SimulatedTransport>, Arc<RoomConnection>, Arc<SimulatedTransport>) {
        let conn = Arc::new(RoomConnection::new());
        let transport = Arc::new(SimulatedTransport::new());
        let player = RoomPlayer::new(Arc::clone(&conn), Arc::clone(&transport));
        (player, conn, transport)
    }

    fn follower_at(
        player: &RoomPlayer<SimulatedTransport>,
        video_id: &str,
        position: f64,
        playing: bool,
    ) {
        player.handle_message(Message::RoomState {
            video_id: video_id.to_string(),
            current_time: position,
            is_playing: playing,
            autoplay: false,
            is_admin: false,
        });
    }

    fn heartbeat(time: f64) -> Message {
        Message::SyncResponse {
            room_id: "r1".to_string(),
            time,
            is_playing: true,
            video_id: "vid-a".to_string(),
            autoplay: false,
        }
    }

    #[test]
    fn heartbeat_interval_clamps_to_bounds() {
        assert_eq!(heartbeat_interval(Duration::ZERO), MIN_SYNC_INTERVAL);
        assert_eq!(
            heartbeat_interval(Duration::from_millis(50)),
            Duration::from_millis(200)
        );
        assert_eq!(heartbeat_interval(Duration::from_secs(1)), MAX_SYNC_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn large_drift_hard_seeks_to_server_time() {
        let (player, _conn, transport) = player();
        follower_at(&player, "vid-a", 10.0, true);

        // drift = 13.5 - 10.0 = 3.5 > threshold
        player.handle_message(heartbeat(13.5));
        assert!((transport.position_secs().unwrap() - 13.5).abs() < 1e-9);
        assert_eq!(transport.rate(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn small_drift_nudges_rate_then_converges() {
        let (player, _conn, transport) = player();
        follower_at(&player, "vid-a", 10.0, true);

        // drift = 0.2s -> rate = 1 + 0.2/0.25 = 1.8, inside the clamp
        player.handle_message(heartbeat(10.2));
        assert!((transport.rate() - 1.8).abs() < 1e-9);

        // After one correction window the rate resets and the position has
        // caught up with the (advancing) authoritative position
        tokio::time::sleep(CORRECTION_WINDOW + Duration::from_millis(20)).await;
        assert_eq!(transport.rate(), 1.0);
        let authoritative = 10.2 + (CORRECTION_WINDOW + Duration::from_millis(20)).as_secs_f64();
        assert!((transport.position_secs().unwrap() - authoritative).abs() < 0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn nudge_rate_is_clamped() {
        let (player, _conn, transport) = player();
        follower_at(&player, "vid-a", 10.0, true);

        // drift = 1.1s is under the threshold but far over the rate clamp
        player.handle_message(heartbeat(11.1));
        assert_eq!(transport.rate(), MAX_PLAYBACK_RATE);

        // A backward drift clamps at the floor
        player.handle_message(heartbeat(
            transport.position_secs().unwrap() - 1.0,
        ));
        assert_eq!(transport.rate(), MIN_PLAYBACK_RATE);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_flags_are_adopted_unconditionally() {
        let (player, _conn, transport) = player();
        follower_at(&player, "vid-a", 10.0, true);
        assert!(!transport.is_paused().unwrap());

        player.handle_message(Message::SyncResponse {
            room_id: "r1".to_string(),
            time: transport.position_secs().unwrap(),
            is_playing: false,
            video_id: "vid-a".to_string(),
            autoplay: true,
        });
        assert!(transport.is_paused().unwrap());
        assert!(!player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn follower_gestures_are_noops() {
        let (player, conn, transport) = player();
        follower_at(&player, "vid-a", 10.0, false);

        player.toggle_play_pause();
        player.seek_to(50.0);
        player.change_video("vid-b");
        player.set_autoplay(true);

        assert!(transport.is_paused().unwrap());
        assert!((transport.position_secs().unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(player.current_video(), "vid-a");
        // No gesture produced an outbound message
        assert!(conn.queued_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn admin_heartbeats_while_playing_and_stops_on_pause() {
        let (player, conn, _transport) = player();
        player.join("r1", true);
        player.handle_message(Message::RoomState {
            video_id: "vid-a".to_string(),
            current_time: 0.0,
            is_playing: false,
            autoplay: false,
            is_admin: true,
        });

        player.toggle_play_pause();
        let baseline = conn.queued_messages().len();

        // Latency is unmeasured, so the interval sits at the 100ms floor
        tokio::time::sleep(Duration::from_millis(350)).await;
        let sent = conn.queued_messages();
        let beats = sent[baseline..]
            .iter()
            .filter(|m| matches!(m, Message::SyncResponse { .. }))
            .count();
        assert!(beats >= 2, "expected heartbeats, got {}", beats);

        // Pausing stops the heartbeat immediately
        tokio::time::sleep(COMMAND_THROTTLE).await;
        player.toggle_play_pause();
        let after_pause = conn.queued_messages().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(conn.queued_messages().len(), after_pause);
    }

    #[tokio::test(start_paused = true)]
    async fn demotion_stops_the_heartbeat() {
        let (player, conn, _transport) = player();
        player.join("r1", true);
        player.handle_message(Message::RoomState {
            video_id: "vid-a".to_string(),
            current_time: 0.0,
            is_playing: false,
            autoplay: false,
            is_admin: true,
        });
        player.toggle_play_pause();

        tokio::time::sleep(Duration::from_millis(350)).await;
        let beats = conn
            .queued_messages()
            .iter()
            .filter(|m| matches!(m, Message::SyncResponse { .. }))
            .count();
        assert!(beats >= 1);

        // Server re-asserts the role; the timer must die with it
        player.handle_message(Message::RoomState {
            video_id: "vid-a".to_string(),
            current_time: 0.0,
            is_playing: true,
            autoplay: false,
            is_admin: false,
        });
        let after_demotion = conn.queued_messages().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(conn.queued_messages().len(), after_demotion);
    }
}
