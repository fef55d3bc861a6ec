use anyhow::Result;
use gods_eye::cli::{Args, DetectorKind};
use gods_eye::event_log::EventLog;
use gods_eye::face_registry::IdentityRegistry;
use gods_eye::pipeline::broadcaster::Broadcaster;
use gods_eye::pipeline::detection::{DetectionOracle, NoopDetector};
use gods_eye::pipeline::identity::{HistogramEmbedder, IdentityOracle};
use gods_eye::pipeline::orchestrator::{Pipeline, PipelineConfig, PipelineHandle};
use gods_eye::pipeline::scheduler::InferenceScheduler;
use gods_eye::video::{CaptureSource, ReplaySource};
use gods_eye::web::api::AppState;
use gods_eye::web::server::run_server;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();
    info!("GODS_EYE tactical surveillance system v{}", env!("CARGO_PKG_VERSION"));

    let events = Arc::new(EventLog::open(&args.log_file, args.log_memory)?);

    let oracle: Arc<dyn IdentityOracle> = Arc::new(HistogramEmbedder::default());
    let registry = Arc::new(IdentityRegistry::open(
        &args.faces_file,
        oracle,
        args.match_threshold,
    )?);
    if let Some(dir) = &args.faces_seed_dir {
        let enrolled = registry.seed_from_dir(dir);
        info!("Seeded {} identities from {:?}", enrolled, dir);
    }

    let scheduler = InferenceScheduler::new(build_detector(&args)?, args.skip_frames)
        .map_err(anyhow::Error::msg)?
        .with_registry(registry.clone());
    let broadcaster = Arc::new(Broadcaster::new(args.subscriber_queue, args.jpeg_quality));
    let pipeline = Pipeline::new(
        build_source(&args)?,
        scheduler,
        broadcaster.clone(),
        events.clone(),
        PipelineConfig {
            capture_retries: args.capture_retries,
            capture_backoff: Duration::from_millis(args.capture_backoff_ms),
        },
    );

    let state = Arc::new(AppState {
        pipeline: pipeline.state(),
        broadcaster,
        events,
        registry,
        default_log_limit: args.default_log_limit,
    });
    let handle = pipeline.spawn()?;

    info!("Video feed: http://{}:{}/video_feed", args.host, args.port);
    run_server(args.host, args.port, state, shutdown_signal(handle)).await?;

    Ok(())
}

/// Resolves on Ctrl-C once the pipeline has stopped. Stopping the pipeline
/// closes the broadcaster, which ends open `/video_feed` streams so the
/// server can drain.
async fn shutdown_signal(handle: PipelineHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, stopping pipeline");
    match tokio::task::spawn_blocking(move || handle.stop()).await {
        Ok(phase) => info!("Pipeline finished in phase {:?}", phase),
        Err(e) => warn!("Pipeline shutdown task failed: {}", e),
    }
}

fn build_source(args: &Args) -> Result<Box<dyn CaptureSource>> {
    match &args.replay_dir {
        Some(dir) => Ok(Box::new(ReplaySource::new(dir, args.fps))),
        None => open_camera(args),
    }
}

#[cfg(feature = "opencv")]
fn open_camera(args: &Args) -> Result<Box<dyn CaptureSource>> {
    Ok(Box::new(gods_eye::video::OpencvCamera::new(
        args.camera_index,
        args.frame_width,
        args.frame_height,
        args.fps,
    )))
}

#[cfg(not(feature = "opencv"))]
fn open_camera(args: &Args) -> Result<Box<dyn CaptureSource>> {
    anyhow::bail!(
        "camera {} requested but this build has no `opencv` feature; use --replay-dir",
        args.camera_index
    )
}

fn build_detector(args: &Args) -> Result<Box<dyn DetectionOracle>> {
    match args.detector {
        DetectorKind::Disabled => {
            info!("Person detection disabled");
            Ok(Box::new(NoopDetector))
        }
        #[cfg(feature = "rtdetr")]
        DetectorKind::Rtdetr => {
            let detector = gods_eye::pipeline::detection::RtDetrDetector::new(
                &args.model_path,
                args.min_confidence,
            )?;
            info!("RT-DETR detector loaded from {}", args.model_path);
            Ok(Box::new(detector))
        }
        #[cfg(not(feature = "rtdetr"))]
        DetectorKind::Rtdetr => {
            warn!("Built without the `rtdetr` feature; running without person detection");
            Ok(Box::new(NoopDetector))
        }
    }
}
