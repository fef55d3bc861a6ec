use clap::{Parser, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum DetectorKind {
    /// RT-DETR person detector (requires the `rtdetr` feature)
    Rtdetr,
    /// Never detects anything
    #[value(name = "none")]
    Disabled,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host to bind to
    #[arg(long, env = "GODS_EYE_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to; successive ports are tried if it is taken
    #[arg(long, env = "GODS_EYE_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Camera device index
    #[arg(long, env = "GODS_EYE_CAMERA_INDEX", default_value_t = 0)]
    pub camera_index: i32,

    #[arg(long, env = "GODS_EYE_FRAME_WIDTH", default_value_t = 640)]
    pub frame_width: u32,

    #[arg(long, env = "GODS_EYE_FRAME_HEIGHT", default_value_t = 480)]
    pub frame_height: u32,

    /// Capture rate, also the pacing rate for --replay-dir
    #[arg(long, env = "GODS_EYE_FPS", default_value_t = 30)]
    pub fps: u32,

    /// Replay a directory of images in a loop instead of opening a camera
    #[arg(long, env = "GODS_EYE_REPLAY_DIR")]
    pub replay_dir: Option<PathBuf>,

    #[arg(long, env = "GODS_EYE_DETECTOR", value_enum, default_value_t = DetectorKind::Rtdetr)]
    pub detector: DetectorKind,

    /// Path to the RT-DETR ONNX model
    #[arg(long, env = "GODS_EYE_MODEL_PATH", default_value = "models/rtdetr-v2-s.onnx")]
    pub model_path: String,

    /// Minimum person confidence kept from the detector
    #[arg(long, env = "GODS_EYE_MIN_CONFIDENCE", default_value_t = 0.5)]
    pub min_confidence: f32,

    /// Run detection on every Nth frame
    #[arg(
        long,
        env = "GODS_EYE_SKIP_FRAMES",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub skip_frames: u64,

    /// Consecutive capture failures tolerated before going offline
    #[arg(long, env = "GODS_EYE_CAPTURE_RETRIES", default_value_t = 5)]
    pub capture_retries: u32,

    /// First retry delay; doubled per attempt up to 5s
    #[arg(long, env = "GODS_EYE_CAPTURE_BACKOFF_MS", default_value_t = 200)]
    pub capture_backoff_ms: u64,

    /// Detection history CSV
    #[arg(long, env = "GODS_EYE_LOG_FILE", default_value = "detection_history.csv")]
    pub log_file: PathBuf,

    /// Number of recent events held in memory
    #[arg(long, env = "GODS_EYE_LOG_MEMORY", default_value_t = 1000)]
    pub log_memory: usize,

    /// `/logs` limit when none is given
    #[arg(long, env = "GODS_EYE_DEFAULT_LOG_LIMIT", default_value_t = 50)]
    pub default_log_limit: usize,

    /// Enrolled identity registry
    #[arg(long, env = "GODS_EYE_FACES_FILE", default_value = "known_faces.json")]
    pub faces_file: PathBuf,

    /// Enroll every image in this directory on startup, named by file stem
    #[arg(long, env = "GODS_EYE_FACES_SEED_DIR")]
    pub faces_seed_dir: Option<PathBuf>,

    /// Maximum cosine distance accepted as a match
    #[arg(long, env = "GODS_EYE_MATCH_THRESHOLD", default_value_t = 0.30)]
    pub match_threshold: f32,

    /// Frames buffered per `/video_feed` client before the oldest is dropped
    #[arg(long, env = "GODS_EYE_SUBSCRIBER_QUEUE", default_value_t = 4)]
    pub subscriber_queue: usize,

    #[arg(long, env = "GODS_EYE_JPEG_QUALITY", default_value_t = 80)]
    pub jpeg_quality: u8,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
