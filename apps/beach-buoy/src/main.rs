use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use beach_buoy::{
    build_coordinator,
    cli::{print_credential, Cli, Commands},
    config::{Config, MediaEngineKind},
    handlers::router,
    media::{transport_channel, LoopbackMediaEngine, MediaEngine, WebRtcMediaEngine},
    state::AppState,
    synth::{HttpSynthCodeSource, NoSynthSource, SynthCodeSource},
    telemetry::Telemetry,
    BackgroundTasks,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);

    if let Some(Commands::Credential { session }) = &cli.command {
        return print_credential(&config, session);
    }

    let telemetry = Telemetry::init()?;
    info!(
        bind = %config.bind_addr(),
        turn = ?config.turn_urls(),
        policy = ?config.ice_transport_policy,
        shared_secret = config.turn_static_auth_secret.is_some(),
        "starting beach-buoy"
    );

    let (events_tx, events_rx) = transport_channel();
    let engine: Arc<dyn MediaEngine> = match config.media_engine {
        MediaEngineKind::WebRtc => Arc::new(
            WebRtcMediaEngine::new(config.webrtc_settings(), events_tx)
                .context("failed to initialise webrtc engine")?,
        ),
        MediaEngineKind::Loopback => Arc::new(LoopbackMediaEngine::with_events(events_tx)),
    };
    info!(engine = engine.name(), "media engine ready");

    let synth: Arc<dyn SynthCodeSource> = match &config.synth_code_url {
        Some(url) => Arc::new(
            HttpSynthCodeSource::new(url.clone()).context("failed to build synth client")?,
        ),
        None => Arc::new(NoSynthSource),
    };

    let coordinator = build_coordinator(&config, engine);
    let tasks = BackgroundTasks::start(&coordinator, events_rx);
    let state = AppState::new(coordinator, synth).with_metrics(telemetry.metrics_handle());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .context("failed to bind listener")?;
    info!(addr = %config.bind_addr(), "beach-buoy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    tasks.abort();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
