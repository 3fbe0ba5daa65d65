// ============================
// crates/viewsync-bin/src/main.rs
// ============================
//! Server binary for viewsync.
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use viewsync_lib::clock;
use viewsync_lib::config::Settings;
use viewsync_lib::http;
use viewsync_lib::jobs::UnavailableRunner;
use viewsync_lib::media::{FsMediaLibrary, NoProbe};
use viewsync_lib::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    info!("Starting viewsync server...");

    let settings = Settings::load()?;
    debug!("Configuration loaded: {:?}", settings);

    if settings.use_https {
        warn!("USE_HTTPS is set; in-process TLS is not wired up, terminate TLS in front of this server");
    }

    std::fs::create_dir_all(&settings.data_dir)?;
    std::fs::create_dir_all(&settings.media_dir)?;
    debug!("Data directories created");

    let library = FsMediaLibrary::new(
        settings.media_dir.clone(),
        &settings.data_dir,
        Box::new(NoProbe),
    )?;

    // Startup sweep: purge sidecar tracks whose source has been gone for a
    // week, refresh lastSeen for the rest.
    match library.sweep_stale_manifests().await {
        Ok(purged) if purged > 0 => info!(purged, "purged stale track manifests"),
        Ok(_) => {},
        Err(e) => warn!(error = %e, "stale manifest sweep failed"),
    }

    let state = Arc::new(
        AppState::new(settings, Arc::new(library), Arc::new(UnavailableRunner)).await?,
    );
    info!(
        legacy_mode = state.legacy_mode(),
        media_tools = state.jobs.enabled(),
        "Application state initialized"
    );

    let ticker = clock::spawn_consolidation_ticker(state.rooms.clone());
    debug!("Consolidation ticker scheduled");

    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(60 * 60));
        loop {
            interval.tick().await;
            limiter.cleanup();
        }
    });
    debug!("Rate limiter cleanup task scheduled");

    let app = http::create_router(state.clone());
    info!("Router created");

    let addr = SocketAddr::from(([0, 0, 0, 0], state.settings.port));
    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // stop the ticker, then give pending writes a bounded drain
    ticker.abort();
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        state.rooms.consolidate_all(clock::now_ms()).await;
    })
    .await;
    if drained.is_err() {
        warn!("shutdown drain timed out, exiting anyway");
    }
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install shutdown signal handler");
    }
    info!("Shutdown requested");
}
