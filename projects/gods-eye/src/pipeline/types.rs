use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Bounding box in pixel units of the frame it was detected on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Integer corners `(x1, y1, x2, y2)` clamped to a `width` x `height` image.
    /// Degenerate or out-of-frame boxes collapse onto the nearest edge.
    pub fn clamp_to(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        let sanitize = |v: f32, max: f32| if v.is_finite() { v.clamp(0.0, max) } else { 0.0 };

        let x1 = sanitize(self.x, max_x);
        let y1 = sanitize(self.y, max_y);
        let x2 = sanitize(self.x + self.w.max(0.0), max_x).max(x1);
        let y2 = sanitize(self.y + self.h.max(0.0), max_y).max(y1);

        (
            x1.round() as u32,
            y1.round() as u32,
            x2.round() as u32,
            y2.round() as u32,
        )
    }
}

/// One detected person. Recomputed wholesale on every inference cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32) -> Self {
        Self {
            bbox,
            confidence: confidence.clamp(0.0, 1.0),
            identity: None,
        }
    }
}

/// An immutable captured (or composited) frame.
///
/// Cloning is cheap: the pixel buffer is shared.
#[derive(Clone, Debug)]
pub struct Frame {
    seq: u64,
    captured_at: DateTime<Utc>,
    image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(seq: u64, captured_at: DateTime<Utc>, image: RgbImage) -> Self {
        Self {
            seq,
            captured_at,
            image: Arc::new(image),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// A new frame with the same sequence number and timestamp but different pixels.
    pub fn with_image(&self, image: RgbImage) -> Self {
        Self {
            seq: self.seq,
            captured_at: self.captured_at,
            image: Arc::new(image),
        }
    }
}

/// Durable record of one inference cycle that found at least one person.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectionEvent {
    pub timestamp: DateTime<Utc>,
    pub num_persons: u32,
    pub confidence: f32,
}

impl DetectionEvent {
    /// Summarise a fresh set of detections. Returns `None` for an empty set.
    pub fn from_detections(timestamp: DateTime<Utc>, detections: &[Detection]) -> Option<Self> {
        if detections.is_empty() {
            return None;
        }
        let total: f32 = detections.iter().map(|d| d.confidence).sum();
        let mean = total / detections.len() as f32;
        Some(Self {
            timestamp,
            num_persons: detections.len() as u32,
            confidence: (mean * 100.0).round() / 100.0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    Starting,
    Running,
    Offline,
    Stopped,
}

/// Snapshot of the latest completed pipeline iteration. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub person_detected: bool,
    pub frame_count: u64,
    pub detections_count: u32,
    pub pipeline: PipelinePhase,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            person_detected: false,
            frame_count: 0,
            detections_count: 0,
            pipeline: PipelinePhase::Starting,
        }
    }
}

/// State written by the pipeline loop and read by the HTTP layer.
#[derive(Debug, Default)]
pub struct PipelineState {
    status: RwLock<PipelineStatus>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> PipelineStatus {
        match self.status.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut PipelineStatus)) {
        let mut guard = match self.status.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }

    pub(crate) fn set_phase(&self, phase: PipelinePhase) {
        self.update(|status| {
            status.pipeline = phase;
            if matches!(phase, PipelinePhase::Offline | PipelinePhase::Stopped) {
                status.person_detected = false;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_keeps_in_frame_box() {
        let bbox = BBox::new(10.0, 20.0, 30.0, 40.0);
        assert_eq!(bbox.clamp_to(100, 100), (10, 20, 40, 60));
    }

    #[test]
    fn test_clamp_overflowing_box() {
        let bbox = BBox::new(-15.0, 90.0, 200.0, 50.0);
        assert_eq!(bbox.clamp_to(100, 100), (0, 90, 99, 99));
    }

    #[test]
    fn test_clamp_negative_size_and_nan() {
        let bbox = BBox::new(f32::NAN, 5.0, -10.0, -3.0);
        assert_eq!(bbox.clamp_to(50, 50), (0, 5, 0, 5));
    }

    #[test]
    fn test_event_uses_mean_confidence() {
        let detections = vec![
            Detection::new(BBox::new(0.0, 0.0, 1.0, 1.0), 0.9),
            Detection::new(BBox::new(0.0, 0.0, 1.0, 1.0), 0.7),
        ];
        let event = DetectionEvent::from_detections(Utc::now(), &detections).unwrap();
        assert_eq!(event.num_persons, 2);
        assert!((event.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_no_event_for_empty_detections() {
        assert!(DetectionEvent::from_detections(Utc::now(), &[]).is_none());
    }

    #[test]
    fn test_offline_degrades_status_but_keeps_frame_count() {
        let state = PipelineState::new();
        state.update(|s| {
            s.person_detected = true;
            s.frame_count = 42;
            s.detections_count = 2;
        });
        state.set_phase(PipelinePhase::Offline);

        let status = state.status();
        assert!(!status.person_detected);
        assert_eq!(status.frame_count, 42);
        assert_eq!(status.pipeline, PipelinePhase::Offline);
    }
}
