use crate::face_registry::IdentityRegistry;
use crate::pipeline::detection::DetectionOracle;
use crate::pipeline::identity::head_crop;
use crate::pipeline::types::{Detection, Frame};
use std::sync::Arc;

pub const DEFAULT_SKIP_FRAMES: u64 = 5;

/// Detections to draw for one frame.
#[derive(Debug, Clone)]
pub struct Inference {
    /// Shared with the scheduler cache; replaced wholesale on each real cycle.
    pub detections: Arc<Vec<Detection>>,
    /// True when the oracle ran on this very frame.
    pub fresh: bool,
    /// Sequence number of the frame the detections were computed on
    /// (0 before the first real cycle).
    pub source_seq: u64,
}

/// Decides per frame whether to run the detection oracle or reuse the last result.
///
/// The oracle runs on every frame whose counter is a multiple of the skip
/// interval; all other frames reuse the cached detections unchanged.
pub struct InferenceScheduler {
    detector: Box<dyn DetectionOracle>,
    registry: Option<Arc<IdentityRegistry>>,
    skip_interval: u64,
    frame_counter: u64,
    cached: Arc<Vec<Detection>>,
    cached_seq: u64,
}

impl InferenceScheduler {
    pub fn new(detector: Box<dyn DetectionOracle>, skip_interval: u64) -> Result<Self, &'static str> {
        if skip_interval < 1 {
            return Err("skip_interval must be >= 1");
        }
        Ok(Self {
            detector,
            registry: None,
            skip_interval,
            frame_counter: 0,
            cached: Arc::new(Vec::new()),
            cached_seq: 0,
        })
    }

    /// Resolve every fresh detection against enrolled identities.
    pub fn with_registry(mut self, registry: Arc<IdentityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn skip_interval(&self) -> u64 {
        self.skip_interval
    }

    pub fn observe(&mut self, frame: &Frame) -> Inference {
        self.frame_counter += 1;
        if self.frame_counter % self.skip_interval != 0 {
            return Inference {
                detections: self.cached.clone(),
                fresh: false,
                source_seq: self.cached_seq,
            };
        }

        let detections = match self.detector.detect(frame.image()) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(
                    "Detection failed on frame {}: {}; treating as no detections",
                    frame.seq(),
                    e
                );
                Vec::new()
            }
        };
        let detections = self.identify(frame, detections);
        tracing::debug!(
            "Frame {}: {} person(s) detected",
            frame.seq(),
            detections.len()
        );

        self.cached = Arc::new(detections);
        self.cached_seq = frame.seq();
        Inference {
            detections: self.cached.clone(),
            fresh: true,
            source_seq: self.cached_seq,
        }
    }

    fn identify(&self, frame: &Frame, mut detections: Vec<Detection>) -> Vec<Detection> {
        let Some(registry) = &self.registry else {
            return detections;
        };
        for detection in &mut detections {
            let Some(face) = head_crop(frame.image(), &detection.bbox) else {
                continue;
            };
            match registry.identify(&face) {
                Ok(found) => detection.identity = found.map(|m| m.name),
                Err(e) => {
                    tracing::warn!("Identity lookup failed on frame {}: {}", frame.seq(), e)
                }
            }
        }
        detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face_registry::DEFAULT_MATCH_THRESHOLD;
    use crate::pipeline::detection::ScriptedDetector;
    use crate::pipeline::identity::{IdentityOracle, ScriptedEmbedder};
    use crate::pipeline::types::BBox;
    use chrono::Utc;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::Ordering;

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Utc::now(), RgbImage::new(64, 64))
    }

    fn person(x: f32, conf: f32) -> Detection {
        Detection::new(BBox::new(x, 0.0, 10.0, 20.0), conf)
    }

    #[test]
    fn test_skip_interval_0_errors() {
        assert!(InferenceScheduler::new(Box::new(ScriptedDetector::new(vec![])), 0).is_err());
    }

    #[test]
    fn test_oracle_runs_only_on_multiples_of_interval() {
        let detector = ScriptedDetector::new(vec![vec![person(1.0, 0.9)]]);
        let calls = detector.calls();
        let mut scheduler = InferenceScheduler::new(Box::new(detector), 5).unwrap();

        for seq in 1..=4 {
            let inference = scheduler.observe(&frame(seq));
            assert!(!inference.fresh);
            assert!(inference.detections.is_empty());
            assert_eq!(inference.source_seq, 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let fifth = scheduler.observe(&frame(5));
        assert!(fifth.fresh);
        assert_eq!(fifth.detections.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_skipped_frames_reuse_last_cycle() {
        let detector = ScriptedDetector::new(vec![
            vec![person(1.0, 0.9)],
            vec![person(2.0, 0.8), person(3.0, 0.7)],
        ]);
        let mut scheduler = InferenceScheduler::new(Box::new(detector), 3).unwrap();

        let mut history = Vec::new();
        for seq in 1..=8 {
            history.push(scheduler.observe(&frame(seq)));
        }

        // Detections(i) == Detections(last multiple of 3 <= i)
        for (idx, inference) in history.iter().enumerate() {
            let i = idx as u64 + 1;
            let anchor = i - i % 3;
            assert_eq!(inference.source_seq, anchor);
            if anchor > 0 {
                let anchor_detections = &history[anchor as usize - 1].detections;
                assert_eq!(&inference.detections, anchor_detections);
            }
        }
        assert_eq!(history[7].detections.len(), 2);
        assert!(history[7].source_seq <= 8);
    }

    #[test]
    fn test_empty_result_clears_previous_boxes() {
        let detector = ScriptedDetector::new(vec![vec![person(1.0, 0.9)], vec![]]);
        let mut scheduler = InferenceScheduler::new(Box::new(detector), 1).unwrap();

        assert_eq!(scheduler.observe(&frame(1)).detections.len(), 1);
        let cleared = scheduler.observe(&frame(2));
        assert!(cleared.fresh);
        assert!(cleared.detections.is_empty());
    }

    #[test]
    fn test_oracle_failure_degrades_to_no_detections() {
        let detector = ScriptedDetector::with_failures(vec![
            Ok(vec![person(1.0, 0.9)]),
            Err("gpu lost".into()),
            Ok(vec![person(1.0, 0.9)]),
        ]);
        let mut scheduler = InferenceScheduler::new(Box::new(detector), 1).unwrap();

        assert_eq!(scheduler.observe(&frame(1)).detections.len(), 1);
        assert!(scheduler.observe(&frame(2)).detections.is_empty());
        assert_eq!(scheduler.observe(&frame(3)).detections.len(), 1);
    }

    #[test]
    fn test_fresh_detections_are_identified() {
        let dir = tempfile::tempdir().unwrap();
        let face = [200, 150, 120];
        let oracle: Arc<dyn IdentityOracle> =
            Arc::new(ScriptedEmbedder::new().with_face(face, vec![1.0, 0.0]));
        let registry = Arc::new(
            IdentityRegistry::open(dir.path().join("faces.json"), oracle, DEFAULT_MATCH_THRESHOLD)
                .unwrap(),
        );
        registry
            .enroll("yadveer", &RgbImage::from_pixel(4, 4, Rgb(face)))
            .unwrap();

        let detector = ScriptedDetector::new(vec![vec![
            Detection::new(BBox::new(0.0, 0.0, 10.0, 10.0), 0.9),
            Detection::new(BBox::new(30.0, 0.0, 10.0, 10.0), 0.8),
        ]]);
        let mut scheduler = InferenceScheduler::new(Box::new(detector), 1)
            .unwrap()
            .with_registry(registry);

        let mut image = RgbImage::new(64, 64);
        image.put_pixel(0, 0, Rgb(face));
        let inference = scheduler.observe(&Frame::new(1, Utc::now(), image));

        assert_eq!(inference.detections[0].identity.as_deref(), Some("yadveer"));
        assert_eq!(inference.detections[1].identity, None);
    }

    #[test]
    fn test_identity_failure_only_drops_that_match() {
        let dir = tempfile::tempdir().unwrap();
        let face = [200, 150, 120];
        let broken = [9, 9, 9];
        let oracle: Arc<dyn IdentityOracle> = Arc::new(
            ScriptedEmbedder::new()
                .with_face(face, vec![1.0, 0.0])
                .with_failure(broken, "embedding model crashed"),
        );
        let registry = Arc::new(
            IdentityRegistry::open(dir.path().join("faces.json"), oracle, DEFAULT_MATCH_THRESHOLD)
                .unwrap(),
        );
        registry
            .enroll("yadveer", &RgbImage::from_pixel(4, 4, Rgb(face)))
            .unwrap();

        let detector = ScriptedDetector::new(vec![vec![
            Detection::new(BBox::new(0.0, 0.0, 10.0, 10.0), 0.9),
            Detection::new(BBox::new(30.0, 0.0, 10.0, 10.0), 0.8),
        ]]);
        let mut scheduler = InferenceScheduler::new(Box::new(detector), 1)
            .unwrap()
            .with_registry(registry);

        let mut image = RgbImage::new(64, 64);
        image.put_pixel(0, 0, Rgb(broken));
        image.put_pixel(30, 0, Rgb(face));
        let inference = scheduler.observe(&Frame::new(1, Utc::now(), image));

        assert!(inference.fresh);
        assert_eq!(inference.detections.len(), 2);
        assert_eq!(inference.detections[0].identity, None);
        assert_eq!(inference.detections[0].confidence, 0.9);
        assert_eq!(inference.detections[1].identity.as_deref(), Some("yadveer"));
    }
}
