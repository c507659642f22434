use anyhow::{Context, Result};
use std::future::Future;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use url::Url;

use tandem_client::connection::{Notice, RetryPolicy, RoomConnection};
use tandem_client::constants::DEFAULT_WS_URL;
use tandem_client::media::{TrackMedia, TrackResolver};
use tandem_client::player::{PlayerEvent, RoomPlayer};
use tandem_client::transport::{MediaTransport, SimulatedTransport};

/// Headless room console: joins (or creates) a room and traces the
/// transport commands a real player would execute. Handy for watching a
/// session without standing up a full client.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_client=debug,info".into()),
        )
        .init();

    let options = CliOptions::parse(env::args().skip(1))?;
    let server_url = env::var("TANDEM_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());

    warm_up_backend(&server_url).await;

    let conn = Arc::new(RoomConnection::new());
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    conn.set_notice_sink(notice_tx);

    let transport = Arc::new(SimulatedTransport::new());
    let resolver = Arc::new(PassthroughResolver);

    let player = RoomPlayer::with_events(Arc::clone(&conn), Arc::clone(&transport), {
        let transport = Arc::clone(&transport);
        move |event| match event {
            PlayerEvent::RoleAssigned { is_admin } => {
                tracing::info!(
                    "You are {} in this room",
                    if is_admin { "the admin" } else { "a participant" }
                );
            }
            PlayerEvent::TrackChanged { video_id } => {
                let resolver = Arc::clone(&resolver);
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    match resolver.resolve(&video_id).await {
                        Ok(media) => {
                            tracing::info!("Now playing: {}", media.title);
                            if let Some(audio_url) = media.audio_url {
                                if let Err(e) = transport.load(&audio_url) {
                                    tracing::warn!("Failed to load audio: {}", e);
                                }
                            }
                        }
                        Err(e) => tracing::warn!("Failed to resolve {}: {}", video_id, e),
                    }
                });
            }
            PlayerEvent::PlaybackToggled { is_playing } => {
                tracing::info!("Playback {}", if is_playing { "started" } else { "paused" });
            }
        }
    });

    // Drive the connection; every server message flows into the player
    {
        let conn = Arc::clone(&conn);
        let player = player.clone();
        let server_url = server_url.clone();
        tokio::spawn(async move {
            conn.run(&server_url, RetryPolicy::default(), move |msg| {
                player.handle_message(msg)
            })
            .await;
        });
    }

    let mut status = tokio::time::interval(Duration::from_secs(10));
    status.tick().await;

    loop {
        tokio::select! {
            notice = notice_rx.recv() => {
                match notice {
                    // (Re)join on every successful connect so reconnects
                    // land back in the room
                    Some(Notice::Connected) => match &options.seed_video {
                        Some(video_id) => player.create(&options.room_id, video_id),
                        None => player.join(&options.room_id, options.wants_admin),
                    },
                    Some(Notice::ConnectionLost) => {
                        let stats = conn.stats_snapshot();
                        tracing::warn!(
                            "Connection lost after {} messages out / {} in; reconnecting...",
                            stats.messages_out,
                            stats.messages_in
                        );
                    }
                    Some(Notice::ConnectFailed(reason)) => {
                        tracing::warn!("Connect failed: {}", reason);
                    }
                    Some(Notice::QueuedWhileDisconnected) => {
                        tracing::warn!("Message queued while disconnected");
                    }
                    Some(Notice::GaveUp) => {
                        tracing::error!("Gave up reconnecting; restart to try again");
                        break;
                    }
                    None => break,
                }
            }
            _ = status.tick() => {
                if let Ok(position) = transport.position_secs() {
                    let video = player.current_video();
                    let label = if video.is_empty() { "<no track>" } else { video.as_str() };
                    tracing::info!(
                        "{} @ {:.1}s ({})",
                        label,
                        position,
                        if player.is_playing() { "playing" } else { "paused" }
                    );
                }
            }
        }
    }

    player.leave();
    Ok(())
}

struct CliOptions {
    room_id: String,
    wants_admin: bool,
    seed_video: Option<String>,
}

impl CliOptions {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut room_id = None;
        let mut wants_admin = false;
        let mut seed_video = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--admin" => wants_admin = true,
                "--video" => seed_video = args.next(),
                other if room_id.is_none() => room_id = Some(other.to_string()),
                other => anyhow::bail!("Unexpected argument: {other}"),
            }
        }

        let room_id = room_id
            .context("Usage: tandem-client <room-id> [--admin] [--video <video-id>]")?;
        // Seeding a track implies creating the room, which implies admin
        if seed_video.is_some() {
            wants_admin = true;
        }

        Ok(Self {
            room_id,
            wants_admin,
            seed_video,
        })
    }
}

/// Resolver stub for the console: display metadata is derived from the id
/// alone; actual audio resolution lives in the embedding application.
struct PassthroughResolver;

impl TrackResolver for PassthroughResolver {
    fn resolve(&self, video_id: &str) -> impl Future<Output = Result<TrackMedia>> + Send {
        let video_id = video_id.to_string();
        async move {
            Ok(TrackMedia {
                title: video_id.clone(),
                thumbnail_url: Some(format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg")),
                audio_url: None,
            })
        }
    }
}

/// One HTTP probe against the server's health route before the first
/// WebSocket attempt, mostly to wake cold deployments.
async fn warm_up_backend(ws_url: &str) {
    let Some(health_url) = health_url_from_ws(ws_url) else {
        return;
    };

    let client = reqwest::Client::new();
    match client
        .get(&health_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) => {
            tracing::info!("Health probe {} returned {}", health_url, response.status());
        }
        Err(e) => {
            tracing::warn!("Health probe {} failed: {}", health_url, e);
        }
    }
}

fn health_url_from_ws(ws_url: &str) -> Option<String> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };

    let mut http = parsed;
    http.set_scheme(scheme).ok()?;
    http.set_path("/healthz");
    http.set_query(None);
    http.set_fragment(None);
    Some(http.to_string())
}
