use crate::error::OracleError;
use crate::pipeline::types::Detection;
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Person detector. Boxes are returned in pixel units of the input image.
///
/// Implementations may hold mutable model state, hence `&mut self`.
pub trait DetectionOracle: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, OracleError>;
}

/// Detector that never finds anyone. Used when no model backend is configured.
pub struct NoopDetector;

impl DetectionOracle for NoopDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, OracleError> {
        Ok(Vec::new())
    }
}

/// Deterministic detector that replays scripted results in order.
///
/// Once the script runs out the last entry repeats; an empty script always
/// returns no detections. `calls()` is shared so callers can observe how often
/// the oracle was actually invoked after handing ownership away.
pub struct ScriptedDetector {
    script: VecDeque<Result<Vec<Detection>, String>>,
    last: Result<Vec<Detection>, String>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<Detection>>) -> Self {
        Self::with_failures(script.into_iter().map(Ok).collect())
    }

    /// Script entries that are `Err` make that call fail with an inference error.
    pub fn with_failures(script: Vec<Result<Vec<Detection>, String>>) -> Self {
        Self {
            script: script.into(),
            last: Ok(Vec::new()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl DetectionOracle for ScriptedDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        self.last.clone().map_err(OracleError::Inference)
    }
}

#[cfg(feature = "rtdetr")]
pub use rtdetr::RtDetrDetector;

#[cfg(feature = "rtdetr")]
mod rtdetr {
    use super::DetectionOracle;
    use crate::error::OracleError;
    use crate::pipeline::types::{BBox, Detection};
    use image::{DynamicImage, RgbImage};
    use usls::models::RTDETR;
    use usls::{Config, Image};

    /// A wrapper around the USLS RT-DETR model that keeps only `person` boxes
    /// and corrects for aspect-ratio padding bugs in the underlying model library.
    pub struct RtDetrDetector {
        model: RTDETR,
        min_confidence: f32,
    }

    impl RtDetrDetector {
        pub fn new(model_path: &str, min_confidence: f32) -> Result<Self, OracleError> {
            let config = Config::default()
                .with_model_file(model_path)
                .with_class_names(&usls::NAMES_COCO_80);

            #[cfg(target_os = "macos")]
            let config = config.with_model_device(usls::Device::CoreMl);

            let config = config
                .commit()
                .map_err(|e| OracleError::Load(e.to_string()))?;
            let model = RTDETR::new(config).map_err(|e| OracleError::Load(e.to_string()))?;
            Ok(Self {
                model,
                min_confidence,
            })
        }
    }

    impl DetectionOracle for RtDetrDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, OracleError> {
            let img_w = image.width() as f32;
            let img_h = image.height() as f32;

            // Correction calculations (USLS RT-DETR bug workaround)
            let (x_corr, y_corr) = if img_w > img_h {
                (img_w / img_h, 1.0)
            } else if img_h > img_w {
                (1.0, img_h / img_w)
            } else {
                (1.0, 1.0)
            };

            let input = Image::from(DynamicImage::ImageRgb8(image.clone()));
            let results = self
                .model
                .forward(&[input])
                .map_err(|e| OracleError::Inference(e.to_string()))?;

            let detections = results
                .into_iter()
                .next()
                .map(|y| y.hbbs)
                .unwrap_or_default()
                .into_iter()
                .filter(|hbb| hbb.name().unwrap_or("") == "person")
                .filter(|hbb| hbb.confidence().unwrap_or(0.0) >= self.min_confidence)
                .map(|hbb| {
                    let bbox = BBox::new(
                        hbb.xmin() * x_corr,
                        hbb.ymin() * y_corr,
                        hbb.width() * x_corr,
                        hbb.height() * y_corr,
                    );
                    Detection::new(bbox, hbb.confidence().unwrap_or(0.0))
                })
                .collect();

            Ok(detections)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::BBox;

    fn person(conf: f32) -> Detection {
        Detection::new(BBox::new(1.0, 2.0, 3.0, 4.0), conf)
    }

    #[test]
    fn test_scripted_detector_replays_then_repeats_last() {
        let mut detector = ScriptedDetector::new(vec![vec![person(0.5)], vec![]]);
        let image = RgbImage::new(4, 4);

        assert_eq!(detector.detect(&image).unwrap().len(), 1);
        assert!(detector.detect(&image).unwrap().is_empty());
        assert!(detector.detect(&image).unwrap().is_empty());
        assert_eq!(detector.calls().load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_scripted_detector_failure_entries() {
        let mut detector =
            ScriptedDetector::with_failures(vec![Err("boom".into()), Ok(vec![person(0.9)])]);
        let image = RgbImage::new(4, 4);

        assert!(matches!(
            detector.detect(&image),
            Err(OracleError::Inference(_))
        ));
        assert_eq!(detector.detect(&image).unwrap().len(), 1);
    }

    #[test]
    fn test_noop_detector_is_empty() {
        assert!(NoopDetector.detect(&RgbImage::new(2, 2)).unwrap().is_empty());
    }
}
