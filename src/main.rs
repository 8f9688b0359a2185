use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use media_gateway::{
    AppState, Config,
    backend::{ExtractionBackend, default_library},
    router,
    transcode::Transcoder,
    workspace::WorkspaceManager,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_gateway=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        error!("server error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    let workspaces = WorkspaceManager::new(&config.download_dir, config.stale_workspace_after);
    workspaces
        .ensure_root()
        .await
        .with_context(|| format!("could not create download dir {:?}", config.download_dir))?;
    let removed = workspaces.sweep_stale().await;
    if removed > 0 {
        info!("removed {removed} stale job workspaces");
    }

    let backend = ExtractionBackend::probe(&config, default_library())
        .await
        .context("no usable extraction backend")?;

    if !Transcoder::new(config.ffmpeg.clone(), config.transcode_timeout)
        .probe()
        .await
    {
        warn!(
            "{} is not usable: /convert_mp3 will answer 503 until it is installed",
            config.ffmpeg.program
        );
    }
    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: rate limiting uses the socket address");
    }

    let state = AppState::new(&config, backend);
    spawn_maintenance(&state, config.rate_limit_window);

    let app = router(state);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("could not bind {}", config.bind_addr))?;

    info!(
        "listening on http://{} with {} download slots",
        config.bind_addr, config.max_concurrent_downloads
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server failed")
}

/// Periodically forgets idle rate-limit clients and stale workspaces.
fn spawn_maintenance(state: &AppState, every: Duration) {
    let rate_limiter = state.rate_limiter.clone();
    let orchestrator = state.orchestrator.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pruned = rate_limiter.prune().await;
            let swept = orchestrator.workspaces().sweep_stale().await;
            if pruned > 0 || swept > 0 {
                info!("maintenance: forgot {pruned} clients, removed {swept} stale workspaces");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("could not listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
