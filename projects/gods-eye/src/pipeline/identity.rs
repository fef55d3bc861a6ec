use crate::error::OracleError;
use crate::pipeline::types::BBox;
use image::RgbImage;
use std::collections::HashMap;

/// Face embedding oracle.
///
/// `Ok(None)` means the image holds no usable face region.
pub trait IdentityOracle: Send + Sync {
    fn embed(&self, image: &RgbImage) -> Result<Option<Vec<f32>>, OracleError>;
}

/// Fraction of a person box, from the top, treated as the head region.
pub const HEAD_FRACTION: f32 = 0.6;

/// Crop the head region of a person box out of `image`.
/// Returns `None` when the clamped region is empty.
pub fn head_crop(image: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
    let head = BBox::new(bbox.x, bbox.y, bbox.w, bbox.h * HEAD_FRACTION);
    let (x1, y1, x2, y2) = head.clamp_to(image.width(), image.height());
    let w = x2.saturating_sub(x1);
    let h = y2.saturating_sub(y1);
    if w == 0 || h == 0 {
        return None;
    }
    Some(image::imageops::crop_imm(image, x1, y1, w, h).to_image())
}

/// Cosine distance in `[0, 2]`. Mismatched, zero-length or non-finite vectors
/// yield `None`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom <= f32::EPSILON {
        return None;
    }
    let distance = 1.0 - dot / denom;
    distance.is_finite().then_some(distance)
}

pub const HUE_BINS: usize = 16;
pub const SAT_BINS: usize = 16;

/// Minimum share of skin-tone pixels for an image to count as a face.
pub const DEFAULT_MIN_SKIN_RATIO: f32 = 0.08;

/// Model-free identity oracle.
///
/// Locates the bounding box of skin-tone pixels and embeds that region as an
/// L2-normalised 2D hue/saturation histogram. Crude next to a learned
/// embedding, but deterministic and dependency free.
pub struct HistogramEmbedder {
    min_skin_ratio: f32,
}

impl HistogramEmbedder {
    pub fn new(min_skin_ratio: f32) -> Self {
        Self { min_skin_ratio }
    }
}

impl Default for HistogramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SKIN_RATIO)
    }
}

impl IdentityOracle for HistogramEmbedder {
    fn embed(&self, image: &RgbImage) -> Result<Option<Vec<f32>>, OracleError> {
        let total = (image.width() as usize) * (image.height() as usize);
        if total == 0 {
            return Ok(None);
        }

        let mut skin = 0usize;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        for (x, y, px) in image.enumerate_pixels() {
            if is_skin(px.0) {
                skin += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        if (skin as f32 / total as f32) < self.min_skin_ratio {
            return Ok(None);
        }

        let mut hist = vec![0.0f32; HUE_BINS * SAT_BINS];
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let [r, g, b] = image.get_pixel(x, y).0;
                let (h, s) = hue_saturation(r, g, b);
                let h_bin = ((h / 360.0) * HUE_BINS as f32).min(HUE_BINS as f32 - 1.0) as usize;
                let s_bin = (s * SAT_BINS as f32).min(SAT_BINS as f32 - 1.0) as usize;
                hist[h_bin * SAT_BINS + s_bin] += 1.0;
            }
        }
        l2_normalize(&mut hist);
        Ok(Some(hist))
    }
}

/// Classic RGB skin-colour rule for daylight illumination.
fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    r > 95 && g > 40 && b > 20 && max - min > 15 && (r - g).abs() > 15 && r > g && r > b
}

fn hue_saturation(r: u8, g: u8, b: u8) -> (f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let s = if max > 0.0 { delta / max } else { 0.0 };
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    (h, s)
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Deterministic oracle keyed on the colour of an image's top-left pixel.
///
/// Unknown colours have no face. Entries mapped to `Err` fail with an
/// inference error.
#[derive(Default)]
pub struct ScriptedEmbedder {
    by_color: HashMap<[u8; 3], Result<Vec<f32>, String>>,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_face(mut self, color: [u8; 3], embedding: Vec<f32>) -> Self {
        self.by_color.insert(color, Ok(embedding));
        self
    }

    pub fn with_failure(mut self, color: [u8; 3], reason: &str) -> Self {
        self.by_color.insert(color, Err(reason.to_string()));
        self
    }
}

impl IdentityOracle for ScriptedEmbedder {
    fn embed(&self, image: &RgbImage) -> Result<Option<Vec<f32>>, OracleError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(None);
        }
        match self.by_color.get(&image.get_pixel(0, 0).0) {
            Some(Ok(embedding)) => Ok(Some(embedding.clone())),
            Some(Err(reason)) => Err(OracleError::Inference(reason.clone())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const SKIN: Rgb<u8> = Rgb([224, 172, 105]);

    fn solid(w: u32, h: u32, color: Rgb<u8>) -> RgbImage {
        RgbImage::from_pixel(w, h, color)
    }

    #[test]
    fn test_cosine_distance_identical_and_orthogonal() {
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).unwrap().abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_rejects_mismatched_lengths() {
        assert!(cosine_distance(&[1.0], &[1.0, 0.0]).is_none());
        assert!(cosine_distance(&[], &[]).is_none());
        assert!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]).is_none());
    }

    #[test]
    fn test_cosine_distance_rejects_non_finite_components() {
        assert!(cosine_distance(&[f32::NAN, 0.0], &[1.0, 0.0]).is_none());
        assert!(cosine_distance(&[1.0, 0.0], &[f32::INFINITY, 0.0]).is_none());
    }

    #[test]
    fn test_head_crop_takes_top_of_box() {
        let image = solid(100, 100, Rgb([0, 0, 0]));
        let crop = head_crop(&image, &BBox::new(10.0, 10.0, 40.0, 50.0)).unwrap();
        assert_eq!(crop.width(), 40);
        assert_eq!(crop.height(), 30);
    }

    #[test]
    fn test_head_crop_outside_frame_is_none() {
        let image = solid(10, 10, Rgb([0, 0, 0]));
        assert!(head_crop(&image, &BBox::new(50.0, 50.0, 5.0, 5.0)).is_none());
    }

    #[test]
    fn test_histogram_embedder_rejects_faceless_image() {
        let embedder = HistogramEmbedder::default();
        let blue = solid(32, 32, Rgb([10, 20, 200]));
        assert!(embedder.embed(&blue).unwrap().is_none());
    }

    #[test]
    fn test_histogram_embedder_same_image_matches_itself() {
        let embedder = HistogramEmbedder::default();
        let mut image = solid(32, 32, Rgb([10, 20, 200]));
        for y in 8..24 {
            for x in 8..24 {
                image.put_pixel(x, y, SKIN);
            }
        }
        let a = embedder.embed(&image).unwrap().unwrap();
        let b = embedder.embed(&image).unwrap().unwrap();
        assert_eq!(a.len(), HUE_BINS * SAT_BINS);
        assert!(cosine_distance(&a, &b).unwrap() < 1e-5);
    }

    #[test]
    fn test_scripted_embedder_lookup() {
        let oracle = ScriptedEmbedder::new()
            .with_face([1, 2, 3], vec![1.0, 0.0])
            .with_failure([9, 9, 9], "model crashed");

        assert_eq!(
            oracle.embed(&solid(2, 2, Rgb([1, 2, 3]))).unwrap(),
            Some(vec![1.0, 0.0])
        );
        assert!(oracle.embed(&solid(2, 2, Rgb([0, 0, 0]))).unwrap().is_none());
        assert!(oracle.embed(&solid(2, 2, Rgb([9, 9, 9]))).is_err());
    }
}
