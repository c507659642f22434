use anyhow::Result;
use std::future::Future;

/// Resolved media for a track, as handed back by the external resolution
/// service.
#[derive(Debug, Clone)]
pub struct TrackMedia {
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub audio_url: Option<String>,
}

/// External collaborator that turns an opaque track id into playable
/// media. Search and download services stay entirely outside this crate.
pub trait TrackResolver: Send + Sync {
    fn resolve(&self, video_id: &str) -> impl Future<Output = Result<TrackMedia>> + Send;
}
