use std::time::Duration;

/// Default sync endpoint; override with TANDEM_WS_URL.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/websocket";

/// Fixed delay between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive connection failures tolerated before giving up for good.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Outbound seek/play_pause are limited to one per window so rapid
/// scrubbing does not flood the coordinator.
pub const COMMAND_THROTTLE: Duration = Duration::from_millis(250);

/// Drift beyond this is corrected with a hard seek instead of a nudge.
pub const DRIFT_THRESHOLD_SECS: f64 = 2.0;

/// Playback-rate clamp for the gradual correction.
pub const MIN_PLAYBACK_RATE: f64 = 0.5;
pub const MAX_PLAYBACK_RATE: f64 = 2.0;

/// How long a rate nudge stays applied before the rate resets to 1.0.
pub const CORRECTION_WINDOW: Duration = Duration::from_millis(250);

/// Admin heartbeat cadence bounds; the interval is clamp(latency * 4, min, max).
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_millis(500);

/// App-level latency probe cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(12);

/// EMA weight for folding a new RTT sample into the latency estimate.
pub const LATENCY_ALPHA: f64 = 0.2;
