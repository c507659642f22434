use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use tandem_server::ws::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_server=debug,info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app = ws::router(AppState::default());

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Tandem Server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
