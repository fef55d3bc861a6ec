use crate::pipeline::glyphs::{glyph_bits, text_width, GLYPH_ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH};
use crate::pipeline::types::{Detection, Frame};
use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};

pub const HUD_ORANGE: Rgb<u8> = Rgb([255, 99, 0]);
pub const STATUS_GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const STATUS_AMBER: Rgb<u8> = Rgb([255, 165, 0]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

const BOX_THICKNESS: i64 = 2;
const CORNER_LENGTH: i64 = 15;
const LABEL_PADDING: i64 = 2;

pub const ACQUIRED_PHRASE: &str = "TARGET ACQUIRED";
const GENERIC_TARGET: &str = "PERSON";

/// HUD chrome drawn on every composited frame.
#[derive(Debug, Clone)]
pub struct Hud {
    pub person_detected: bool,
    pub frame_count: u64,
    pub timestamp: DateTime<Utc>,
}

/// Label for one detection; the matched identity replaces the generic target.
pub fn label_text(detection: &Detection) -> String {
    let target = detection
        .identity
        .as_deref()
        .map(str::to_uppercase)
        .unwrap_or_else(|| GENERIC_TARGET.to_string());
    format!(
        "{}: {} [CONF: {}%]",
        ACQUIRED_PHRASE,
        target,
        (detection.confidence * 100.0) as u32
    )
}

/// Draw detections and HUD chrome onto a copy of `frame`.
///
/// The input frame is never modified. Geometry outside the frame is clamped.
pub fn compose(frame: &Frame, detections: &[Detection], hud: &Hud) -> Frame {
    let mut canvas = frame.image().clone();

    for detection in detections {
        draw_detection(&mut canvas, detection);
    }
    draw_hud(&mut canvas, hud);

    frame.with_image(canvas)
}

fn draw_detection(canvas: &mut RgbImage, detection: &Detection) {
    let (x1, y1, x2, y2) = detection.bbox.clamp_to(canvas.width(), canvas.height());
    let (x1, y1, x2, y2) = (x1 as i64, y1 as i64, x2 as i64, y2 as i64);

    draw_rect_outline(canvas, x1, y1, x2, y2, BOX_THICKNESS, HUD_ORANGE);

    // Corner accents, one pixel heavier than the box.
    let t = BOX_THICKNESS;
    let corners = [
        (x1, y1, 1, 1),
        (x2, y1, -1, 1),
        (x1, y2, 1, -1),
        (x2, y2, -1, -1),
    ];
    for (cx, cy, dx, dy) in corners {
        let (ex, ey) = (cx + dx * CORNER_LENGTH, cy + dy * CORNER_LENGTH);
        let (tx, ty) = (cx + dx * t, cy + dy * t);
        fill_rect(canvas, cx.min(ex), cy.min(ty), cx.max(ex), cy.max(ty), HUD_ORANGE);
        fill_rect(canvas, cx.min(tx), cy.min(ey), cx.max(tx), cy.max(ey), HUD_ORANGE);
    }

    let label = label_text(detection);
    let text_w = text_width(&label, 1) as i64;
    let text_h = GLYPH_HEIGHT as i64;
    let label_top = (y1 - text_h - 2 * LABEL_PADDING - 2).max(0);
    fill_rect(
        canvas,
        x1,
        label_top,
        x1 + text_w + 2 * LABEL_PADDING,
        label_top + text_h + 2 * LABEL_PADDING - 1,
        LABEL_BACKGROUND,
    );
    draw_text(canvas, x1 + LABEL_PADDING, label_top + LABEL_PADDING, &label, HUD_ORANGE, 1);
}

fn draw_hud(canvas: &mut RgbImage, hud: &Hud) {
    let width = canvas.width() as i64;
    let height = canvas.height() as i64;

    let stamp = format!("[GODS_EYE] {}", hud.timestamp.format("%Y-%m-%d %H:%M:%S"));
    draw_text(canvas, 10, 10, &stamp, HUD_ORANGE, 1);

    let counter = format!("FRAME: {}", hud.frame_count);
    let counter_x = width - text_width(&counter, 1) as i64 - 10;
    draw_text(canvas, counter_x.max(0), 10, &counter, HUD_ORANGE, 1);

    let (status, color) = if hud.person_detected {
        (format!("STATUS: {}", ACQUIRED_PHRASE), STATUS_GREEN)
    } else {
        ("STATUS: SEARCHING...".to_string(), STATUS_AMBER)
    };
    let status_y = height - 2 * GLYPH_HEIGHT as i64 - 10;
    draw_text(canvas, 10, status_y.max(0), &status, color, 2);
}

/// Fill the inclusive rectangle `[x1, x2] x [y1, y2]`, clipped to the canvas.
fn fill_rect(canvas: &mut RgbImage, x1: i64, y1: i64, x2: i64, y2: i64, color: Rgb<u8>) {
    let max_x = canvas.width() as i64 - 1;
    let max_y = canvas.height() as i64 - 1;
    if max_x < 0 || max_y < 0 {
        return;
    }
    let (x1, x2) = (x1.max(0), x2.min(max_x));
    let (y1, y2) = (y1.max(0), y2.min(max_y));
    for y in y1..=y2 {
        for x in x1..=x2 {
            canvas.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_rect_outline(
    canvas: &mut RgbImage,
    x1: i64,
    y1: i64,
    x2: i64,
    y2: i64,
    thickness: i64,
    color: Rgb<u8>,
) {
    let t = thickness - 1;
    fill_rect(canvas, x1, y1, x2, y1 + t, color);
    fill_rect(canvas, x1, y2 - t, x2, y2, color);
    fill_rect(canvas, x1, y1, x1 + t, y2, color);
    fill_rect(canvas, x2 - t, y1, x2, y2, color);
}

fn draw_text(canvas: &mut RgbImage, x: i64, y: i64, text: &str, color: Rgb<u8>, scale: u32) {
    let scale = scale.max(1) as i64;
    let mut pen_x = x;
    for ch in text.chars() {
        if let Some(rows) = glyph_bits(ch) {
            for (row, pattern) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH as i64 {
                    if (pattern >> (GLYPH_WIDTH as i64 - 1 - col)) & 1 == 1 {
                        let px = pen_x + col * scale;
                        let py = y + row as i64 * scale;
                        fill_rect(canvas, px, py, px + scale - 1, py + scale - 1, color);
                    }
                }
            }
        }
        pen_x += GLYPH_ADVANCE as i64 * scale;
    }
}
