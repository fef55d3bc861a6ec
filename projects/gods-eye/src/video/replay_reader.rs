// Capture source that replays a directory of still images in a loop
//
// Stands in for a camera on machines without one. Frames are paced at the
// configured fps so the pipeline sees the same cadence a device would give.

use super::{list_images, CaptureSource};
use crate::error::CaptureError;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub struct ReplaySource {
    dir: PathBuf,
    frame_interval: Option<Duration>,
    files: Vec<PathBuf>,
    position: usize,
    last_frame: Option<Instant>,
}

impl ReplaySource {
    /// `fps == 0` disables pacing.
    pub fn new(dir: impl Into<PathBuf>, fps: u32) -> Self {
        let frame_interval = (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64));
        Self {
            dir: dir.into(),
            frame_interval,
            files: Vec::new(),
            position: 0,
            last_frame: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_frame) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame = Some(Instant::now());
    }
}

impl CaptureSource for ReplaySource {
    fn open(&mut self) -> Result<(), CaptureError> {
        if !self.dir.is_dir() {
            return Err(CaptureError::Unavailable(format!(
                "replay directory {:?} does not exist",
                self.dir
            )));
        }
        let files = list_images(&self.dir);
        if files.is_empty() {
            return Err(CaptureError::Unavailable(format!(
                "no images found in replay directory {:?}",
                self.dir
            )));
        }
        tracing::info!(
            "ReplaySource: opened {:?} with {} image(s)",
            self.dir,
            files.len()
        );
        self.files = files;
        self.position = 0;
        self.last_frame = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if self.files.is_empty() {
            return Err(CaptureError::Read("replay source is not open".into()));
        }
        self.pace();

        let path = &self.files[self.position % self.files.len()];
        self.position = (self.position + 1) % self.files.len();
        let image = image::open(path)
            .map_err(|e| CaptureError::Read(format!("{:?}: {}", path, e)))?;
        Ok(image.to_rgb8())
    }

    fn release(&mut self) {
        if !self.files.is_empty() {
            tracing::info!("ReplaySource: released {:?}", self.dir);
        }
        self.files.clear();
        self.position = 0;
    }

    fn describe(&self) -> String {
        format!("replay:{}", self.dir.display())
    }
}
