use super::CaptureSource;
use crate::error::CaptureError;
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH,
        CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY,
    },
};

fn cv_err(e: opencv::Error) -> CaptureError {
    CaptureError::Read(e.to_string())
}

/// Live camera on a device index.
pub struct OpencvCamera {
    index: i32,
    width: u32,
    height: u32,
    fps: u32,
    capture: Option<VideoCapture>,
}

impl OpencvCamera {
    pub fn new(index: i32, width: u32, height: u32, fps: u32) -> Self {
        Self {
            index,
            width,
            height,
            fps,
            capture: None,
        }
    }
}

impl CaptureSource for OpencvCamera {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.release();

        let mut capture = VideoCapture::new(self.index, CAP_ANY)
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        if !capture.is_opened().map_err(cv_err)? {
            return Err(CaptureError::Unavailable(format!(
                "camera {} could not be opened",
                self.index
            )));
        }

        // Best effort: devices pick the closest mode they support.
        let _ = capture.set(CAP_PROP_FRAME_WIDTH, self.width as f64);
        let _ = capture.set(CAP_PROP_FRAME_HEIGHT, self.height as f64);
        let _ = capture.set(CAP_PROP_FPS, self.fps as f64);
        if let Ok(false) = capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            tracing::debug!("OpencvCamera: hardware acceleration not available");
        }

        let actual_w = capture.get(CAP_PROP_FRAME_WIDTH).unwrap_or(0.0);
        let actual_h = capture.get(CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0);
        let mut actual_fps = capture.get(CAP_PROP_FPS).unwrap_or(0.0);
        if actual_fps <= 0.0 {
            tracing::warn!(
                "OpencvCamera: device did not report FPS, assuming {}",
                self.fps
            );
            actual_fps = self.fps as f64;
        }
        tracing::info!(
            "OpencvCamera: opened camera {} at {}x{} @ {:.1} fps",
            self.index,
            actual_w,
            actual_h,
            actual_fps
        );

        self.capture = Some(capture);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RgbImage, CaptureError> {
        let capture = self
            .capture
            .as_mut()
            .ok_or_else(|| CaptureError::Read("camera is not open".into()))?;

        let mut bgr = Mat::default();
        let success = capture.read(&mut bgr).map_err(cv_err)?;
        if !success || bgr.empty() {
            return Err(CaptureError::Read(format!(
                "camera {} returned no frame",
                self.index
            )));
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB).map_err(cv_err)?;
        if !rgb.is_continuous() {
            return Err(CaptureError::Read("frame buffer is not continuous".into()));
        }
        let width = rgb.cols() as u32;
        let height = rgb.rows() as u32;
        let data = rgb.data_bytes().map_err(cv_err)?.to_vec();
        RgbImage::from_raw(width, height, data)
            .ok_or_else(|| CaptureError::Read("frame buffer size mismatch".into()))
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                tracing::warn!("OpencvCamera: failed to release camera {}: {}", self.index, e);
            } else {
                tracing::info!("OpencvCamera: released camera {}", self.index);
            }
        }
    }

    fn describe(&self) -> String {
        format!("camera:{}", self.index)
    }
}

impl Drop for OpencvCamera {
    fn drop(&mut self) {
        self.release();
    }
}
