#[cfg(feature = "opencv")]
pub mod opencv_reader;
pub mod replay_reader;

#[cfg(feature = "opencv")]
pub use opencv_reader::OpencvCamera;
pub use replay_reader::ReplaySource;

use crate::error::CaptureError;
use image::RgbImage;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// The single video device owned by the pipeline loop.
///
/// `next_frame` blocks at the device's native rate; nothing else paces the loop.
pub trait CaptureSource: Send {
    /// Acquire the device. Calling `open` on an already open source reopens it.
    fn open(&mut self) -> Result<(), CaptureError>;
    fn next_frame(&mut self) -> Result<RgbImage, CaptureError>;
    /// Give the device back. Safe to call more than once.
    fn release(&mut self);
    fn describe(&self) -> String;
}

/// Still images directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| matches!(s.to_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp"))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    images.sort();
    images
}
