use crate::api::ApiServer;
use crate::capture::{
    CaptureServices, FfmpegTranscoder, HttpStreamingRecognizer, PortAllocator, RecordingRegistry,
};
use crate::cli::ServeCliArgs;
use crate::config::Config;
use crate::engine::{LoopbackEngine, MediaEngine};
use crate::relay::{CdsRelay, WsRelay};
use crate::room::{RoomRegistry, RoomServices, RoomSettings};
use crate::throttle::{NetworkThrottle, ShellThrottle};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn run_service(args: ServeCliArgs) -> Result<()> {
    info!("Starting carecall service");

    let mut config = Config::load()?;
    if let Some(port) = args.port {
        config.server.http_port = port;
    }

    let engine = build_engine(&args)?;
    let services = build_services(&config, engine)?;
    let registry = Arc::new(RoomRegistry::new(services));

    let shutdown = CancellationToken::new();
    let api_server = ApiServer::new(Arc::clone(&registry), &config.server);
    let mut server = tokio::spawn(api_server.start(shutdown.clone()));

    info!("carecall is ready!");

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => info!("API server stopped"),
                Ok(Err(e)) => error!("API server failed: {:#}", e),
                Err(e) => error!("API server task failed: {}", e),
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested, closing rooms");
        }
    }

    registry.close_all().await;
    shutdown.cancel();
    if !server.is_finished() {
        let _ = server.await;
    }

    Ok(())
}

fn build_engine(args: &ServeCliArgs) -> Result<Arc<dyn MediaEngine>> {
    if !args.loopback {
        bail!(
            "no native media engine is linked into this build; \
             run `carecall serve --loopback` for signaling development"
        );
    }
    warn!("Using the loopback media engine: signaling works, media is not forwarded");
    Ok(Arc::new(LoopbackEngine::new()))
}

pub fn build_services(config: &Config, engine: Arc<dyn MediaEngine>) -> Result<RoomServices> {
    let relay: Option<Arc<dyn CdsRelay>> = match &config.relay.url {
        Some(url) => {
            info!("CDS relay enabled at {}", url);
            Some(Arc::new(WsRelay::new(url.clone())))
        }
        None => {
            info!("CDS relay disabled (no relay.url configured)");
            None
        }
    };

    let throttle: Option<Arc<dyn NetworkThrottle>> =
        Some(Arc::new(ShellThrottle::new(config.throttle.command.clone())));

    Ok(RoomServices {
        engine,
        capture: build_capture(config)?,
        relay,
        throttle,
        settings: RoomSettings::from_config(config),
    })
}

/// Capture is switched off, with a warning, when one of its external pieces
/// is missing.
fn build_capture(config: &Config) -> Result<Option<CaptureServices>> {
    let capture = &config.capture;
    if !capture.enabled {
        info!("Audio capture disabled in config");
        return Ok(None);
    }

    let Some(endpoint) = config.speech.endpoint.clone() else {
        warn!("Audio capture disabled: no speech.endpoint configured");
        return Ok(None);
    };

    let transcoder = match FfmpegTranscoder::new(capture.ffmpeg_path.as_deref()) {
        Ok(transcoder) => transcoder,
        Err(e) => {
            warn!("Audio capture disabled: {:#}", e);
            return Ok(None);
        }
    };

    let work_dir = capture.work_dir()?;
    std::fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create capture directory {:?}", work_dir))?;

    let ports = PortAllocator::from_config(capture)?;
    info!(
        "Audio capture enabled [ports:{}-{}, dir:{:?}]",
        capture.port_min, capture.port_max, work_dir
    );

    Ok(Some(CaptureServices {
        transcoder: Arc::new(transcoder),
        recognizer: Arc::new(HttpStreamingRecognizer::new(
            endpoint,
            config.speech.api_key.clone(),
        )),
        ports,
        registry: RecordingRegistry::default(),
        config: capture.clone(),
        work_dir,
    }))
}
