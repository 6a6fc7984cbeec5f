use feedreader_proxy::cache::MediaCache;
use feedreader_proxy::proxy::build_router;
use feedreader_proxy::settings::{self, Settings};
use feedreader_proxy::AppState;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedreader_proxy=info,tower_http=info".into()),
        )
        .init();

    let settings_path = std::env::var("FEED_PROXY_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("settings.json"));
    let settings = settings::shared(Settings::load(&settings_path));

    let cache_dir = std::env::var("FEED_PROXY_CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("media-cache"));
    let cache = match MediaCache::new(&cache_dir) {
        Ok(cache) => cache,
        Err(err) => {
            tracing::error!(dir = %cache_dir.display(), %err, "cannot create media cache directory");
            std::process::exit(1);
        }
    };

    let port = std::env::var("FEED_PROXY_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .or_else(portpicker::pick_unused_port)
        .expect("failed to find a free port");

    let app = build_router(AppState::new(settings, cache));

    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(port, %err, "cannot bind proxy port");
            std::process::exit(1);
        }
    };
    tracing::info!(port, cache_dir = %cache_dir.display(), "proxy server listening");

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(%err, "proxy server exited");
        std::process::exit(1);
    }
}
