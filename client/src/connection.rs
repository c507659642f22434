use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::constants::{
    COMMAND_THROTTLE, LATENCY_ALPHA, MAX_RECONNECT_ATTEMPTS, PING_INTERVAL, RECONNECT_INTERVAL,
};
use crate::protocol::Message;

/// Connectivity events surfaced to the owner. Nothing fails silently:
/// every transition is logged and, when a sink is attached, delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Connected,
    ConnectionLost,
    ConnectFailed(String),
    QueuedWhileDisconnected,
    /// The retry ceiling was hit; manual intervention (restart) required.
    GaveUp,
}

/// Reconnect pacing. Injected at the call site so tests can shrink it.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: RECONNECT_INTERVAL,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// One persistent connection to the sync server: offline FIFO queue,
/// reconnect loop, and a smoothed latency estimate from app-level
/// ping/pong round trips.
pub struct RoomConnection {
    inner: Arc<ConnectionState>,
}

struct ConnectionState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    connecting: AtomicBool,
    queue: Mutex<VecDeque<Message>>,
    latency: Mutex<LatencyEstimate>,
    ping_sent_at: Mutex<Option<Instant>>,
    last_command_at: Mutex<Option<tokio::time::Instant>>,
    notices: Mutex<Option<mpsc::UnboundedSender<Notice>>>,
    stats: Mutex<ConnectionStats>,
}

#[derive(Default)]
struct ConnectionStats {
    messages_out: u64,
    messages_in: u64,
    last_rtt_ms: Option<f32>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
}

pub struct ConnectionStatsSnapshot {
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_rtt_ms: Option<f32>,
    pub reconnect_attempts: u32,
    pub connected_duration: Option<f32>,
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

impl RoomConnection {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectionState {
                tx: Mutex::new(None),
                connecting: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                latency: Mutex::new(LatencyEstimate::default()),
                ping_sent_at: Mutex::new(None),
                last_command_at: Mutex::new(None),
                notices: Mutex::new(None),
                stats: Mutex::new(ConnectionStats::default()),
            }),
        }
    }

    /// Attach a channel that receives connectivity notices.
    pub fn set_notice_sink(&self, sink: mpsc::UnboundedSender<Notice>) {
        *self.inner.notices.lock() = Some(sink);
    }

    /// Connect once. Returns a receiver that resolves when the socket
    /// closes. Messages queued while offline are flushed FIFO, exactly
    /// once each, before anything else goes out.
    pub async fn connect<F>(&self, server_url: &str, on_message: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.inner.connecting.store(true, Ordering::SeqCst);
        let result = connect_async(server_url).await;
        self.inner.connecting.store(false, Ordering::SeqCst);
        let (ws_stream, _) = result.context("Failed to connect to server")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.inner.tx.lock() = Some(tx);
        self.inner.mark_connected();
        self.inner.notify(Notice::Connected);

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            send_inner.clear_transport();
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Receiver task: probes are answered/consumed here, everything
        // else goes to the handler
        let handler = Arc::new(on_message);
        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming();
                        match serde_json::from_str::<Message>(&text) {
                            Ok(Message::Ping) => {
                                if let Err(e) = recv_inner.transmit(&Message::Pong) {
                                    tracing::warn!("Failed to answer ping: {}", e);
                                }
                            }
                            Ok(Message::Pong) => recv_inner.record_pong(),
                            Ok(parsed) => handler(parsed),
                            Err(e) => tracing::warn!("Ignoring malformed message: {}", e),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            recv_inner.clear_transport();
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Flush everything queued while offline before the first probe
        self.inner.flush_queue();

        // Latency probes: ping right away so the first heartbeats already
        // have an estimate, then on a fixed cadence
        let ping_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                if ping_inner.send_ping().is_err() {
                    break;
                }
                sleep(PING_INTERVAL).await;
            }
        });

        Ok(disconnect_rx)
    }

    /// Drive the connection until the retry ceiling is hit. The attempt
    /// counter resets on every successful connect; after `max_attempts`
    /// consecutive failures a `GaveUp` notice is emitted and the loop ends.
    pub async fn run<F>(&self, server_url: &str, policy: RetryPolicy, on_message: F)
    where
        F: Fn(Message) + Send + Sync + Clone + 'static,
    {
        let mut attempts: u32 = 0;
        loop {
            match self.connect(server_url, on_message.clone()).await {
                Ok(disconnect_rx) => {
                    attempts = 0;
                    tracing::info!("Connected to sync server at {}", server_url);
                    let _ = disconnect_rx.await;
                    self.inner.mark_disconnected();
                    self.inner.notify(Notice::ConnectionLost);
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to sync server at {}: {}", server_url, e);
                    self.inner.notify(Notice::ConnectFailed(e.to_string()));
                }
            }

            attempts += 1;
            if attempts >= policy.max_attempts {
                tracing::error!("Max reconnection attempts reached; manual restart required");
                self.inner.notify(Notice::GaveUp);
                return;
            }
            sleep(policy.interval).await;
        }
    }

    /// Send now if connected, queue otherwise. Seek/play_pause are
    /// throttled to one per window.
    pub fn send(&self, message: Message) {
        if matches!(message, Message::Seek { .. } | Message::PlayPause { .. })
            && !self.inner.pass_throttle()
        {
            return;
        }

        if self.inner.tx.lock().is_some() {
            match self.inner.transmit(&message) {
                Ok(()) => return,
                // The socket went away mid-send; fall through to the queue
                Err(e) => tracing::debug!("Transmit failed, queueing: {}", e),
            }
        }

        let connecting = self.inner.connecting.load(Ordering::SeqCst);
        self.inner.queue.lock().push_back(message);
        if !connecting {
            tracing::warn!("Attempted to send message while disconnected; queued");
            self.inner.notify(Notice::QueuedWhileDisconnected);
        }
    }

    /// Smoothed one-way latency to the server.
    pub fn latency(&self) -> Duration {
        self.inner.latency.lock().one_way()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    pub fn stats_snapshot(&self) -> ConnectionStatsSnapshot {
        let stats = self.inner.stats.lock();
        ConnectionStatsSnapshot {
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_rtt_ms: stats.last_rtt_ms,
            reconnect_attempts: stats.reconnect_attempts,
            connected_duration: stats.connected_since.map(|t| t.elapsed().as_secs_f32()),
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_messages(&self) -> Vec<Message> {
        self.inner.queue.lock().iter().cloned().collect()
    }
}

impl Default for RoomConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    fn transmit(&self, message: &Message) -> Result<()> {
        let json = serde_json::to_string(message).context("Failed to serialize message")?;
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| anyhow!("socket not connected"))?;
        tx.send(WsMessage::Text(json.into()))
            .map_err(|_| anyhow!("socket send queue closed"))?;
        self.record_outgoing();
        Ok(())
    }

    fn flush_queue(&self) {
        let queued: Vec<Message> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for (index, message) in queued.iter().enumerate() {
            if let Err(e) = self.transmit(message) {
                tracing::warn!("Flush interrupted, re-queueing remainder: {}", e);
                let mut queue = self.queue.lock();
                for message in queued[index..].iter().rev() {
                    queue.push_front(message.clone());
                }
                return;
            }
        }
    }

    fn send_ping(&self) -> Result<()> {
        *self.ping_sent_at.lock() = Some(Instant::now());
        self.transmit(&Message::Ping)
    }

    fn record_pong(&self) {
        let sent_at = self.ping_sent_at.lock().take();
        if let Some(sent_at) = sent_at {
            let rtt = sent_at.elapsed();
            self.latency.lock().record_rtt(rtt);
            self.stats.lock().last_rtt_ms = Some(rtt.as_secs_f32() * 1000.0);
        }
    }

    fn pass_throttle(&self) -> bool {
        let mut last = self.last_command_at.lock();
        let now = tokio::time::Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < COMMAND_THROTTLE => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn clear_transport(&self) {
        *self.tx.lock() = None;
        *self.ping_sent_at.lock() = None;
    }

    fn notify(&self, notice: Notice) {
        tracing::debug!("Connection notice: {:?}", notice);
        if let Some(sink) = self.notices.lock().as_ref() {
            let _ = sink.send(notice);
        }
    }

    fn record_outgoing(&self) {
        self.stats.lock().messages_out += 1;
    }

    fn record_incoming(&self) {
        self.stats.lock().messages_in += 1;
    }

    fn mark_connected(&self) {
        self.stats.lock().connected_since = Some(Instant::now());
    }

    fn mark_disconnected(&self) {
        let mut stats = self.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_estimate_folds_samples() {
        let mut estimate = LatencyEstimate::default();
        estimate.record_rtt(Duration::from_millis(100));
        assert_eq!(estimate.one_way(), Duration::from_millis(50));

        // 50ms * 0.8 + 100ms * 0.2 = 60ms
        estimate.record_rtt(Duration::from_millis(200));
        assert_eq!(estimate.one_way(), Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn seek_and_play_pause_are_throttled() {
        let conn = RoomConnection::new();
        conn.send(Message::Seek {
            room_id: "r1".to_string(),
            time: 1.0,
        });
        // Within the window the second command is dropped
        conn.send(Message::Seek {
            room_id: "r1".to_string(),
            time: 2.0,
        });
        assert_eq!(conn.queued_messages().len(), 1);

        tokio::time::advance(COMMAND_THROTTLE + Duration::from_millis(1)).await;
        conn.send(Message::PlayPause {
            room_id: "r1".to_string(),
            is_playing: true,
        });
        assert_eq!(conn.queued_messages().len(), 2);
    }

    #[tokio::test]
    async fn offline_sends_queue_in_order_with_notice() {
        let conn = RoomConnection::new();
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        conn.set_notice_sink(notice_tx);

        conn.send(Message::JoinRoom {
            room_id: "r1".to_string(),
            is_admin: false,
        });
        conn.send(Message::SyncRequest {
            room_id: "r1".to_string(),
        });

        let queued = conn.queued_messages();
        assert!(matches!(queued[0], Message::JoinRoom { .. }));
        assert!(matches!(queued[1], Message::SyncRequest { .. }));
        assert_eq!(notice_rx.try_recv().unwrap(), Notice::QueuedWhileDisconnected);
    }
}
