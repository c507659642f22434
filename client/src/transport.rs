use anyhow::Result;
use parking_lot::Mutex;
use tokio::time::Instant;

/// The local media element seam. Whatever actually renders audio (a real
/// player, a browser bridge) sits behind this trait; the sync layer never
/// sees anything more specific. Failures are logged by callers, never
/// propagated across the sync boundary.
pub trait MediaTransport: Send + Sync {
    /// Swap in a new source; position is expected to reset to zero.
    fn load(&self, audio_url: &str) -> Result<()>;
    fn play(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    /// Jump to a position, in seconds.
    fn seek(&self, position_secs: f64) -> Result<()>;
    /// Playback rate; 1.0 is realtime.
    fn set_rate(&self, rate: f64) -> Result<()>;
    fn position_secs(&self) -> Result<f64>;
    fn is_paused(&self) -> Result<bool>;
}

/// Clock-driven stand-in for a real media element: position advances with
/// time while playing, scaled by the current rate. Backs the headless
/// console and the synchronizer tests (tokio's clock, so paused-time tests
/// are deterministic).
pub struct SimulatedTransport {
    inner: Mutex<SimState>,
}

struct SimState {
    source: Option<String>,
    anchor_secs: f64,
    anchor_at: Instant,
    playing: bool,
    rate: f64,
}

impl SimState {
    fn current_position(&self) -> f64 {
        if self.playing {
            self.anchor_secs + self.anchor_at.elapsed().as_secs_f64() * self.rate
        } else {
            self.anchor_secs
        }
    }

    fn reanchor(&mut self) {
        self.anchor_secs = self.current_position();
        self.anchor_at = Instant::now();
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimState {
                source: None,
                anchor_secs: 0.0,
                anchor_at: Instant::now(),
                playing: false,
                rate: 1.0,
            }),
        }
    }

    pub fn source(&self) -> Option<String> {
        self.inner.lock().source.clone()
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().rate
    }
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaTransport for SimulatedTransport {
    fn load(&self, audio_url: &str) -> Result<()> {
        let mut state = self.inner.lock();
        state.source = Some(audio_url.to_string());
        state.anchor_secs = 0.0;
        state.anchor_at = Instant::now();
        Ok(())
    }

    fn play(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.reanchor();
        state.playing = true;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.reanchor();
        state.playing = false;
        Ok(())
    }

    fn seek(&self, position_secs: f64) -> Result<()> {
        let mut state = self.inner.lock();
        state.anchor_secs = position_secs.max(0.0);
        state.anchor_at = Instant::now();
        Ok(())
    }

    fn set_rate(&self, rate: f64) -> Result<()> {
        let mut state = self.inner.lock();
        state.reanchor();
        state.rate = rate;
        Ok(())
    }

    fn position_secs(&self) -> Result<f64> {
        Ok(self.inner.lock().current_position())
    }

    fn is_paused(&self) -> Result<bool> {
        Ok(!self.inner.lock().playing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn position_advances_only_while_playing() {
        let transport = SimulatedTransport::new();
        assert_eq!(transport.position_secs().unwrap(), 0.0);

        transport.play().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((transport.position_secs().unwrap() - 2.0).abs() < 1e-9);

        transport.pause().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((transport.position_secs().unwrap() - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_scales_advancement() {
        let transport = SimulatedTransport::new();
        transport.play().unwrap();
        transport.set_rate(1.5).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((transport.position_secs().unwrap() - 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_and_load_reset_the_anchor() {
        let transport = SimulatedTransport::new();
        transport.play().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        transport.seek(60.0).unwrap();
        assert!((transport.position_secs().unwrap() - 60.0).abs() < 1e-9);

        transport.load("https://example.invalid/audio").unwrap();
        assert_eq!(transport.position_secs().unwrap(), 0.0);
        assert_eq!(
            transport.source().as_deref(),
            Some("https://example.invalid/audio")
        );
    }
}
