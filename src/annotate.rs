//! Detection overlays.
//!
//! `FrameAnnotator` draws each detection onto a copy of the frame: a 2px
//! green box, a filled green strip above it and the text
//! `"{label} {confidence:.2}"` in black using a built-in 5x7 bitmap font.
//! It also owns the single rule deciding whether a detection qualifies as a
//! pothole event.

use image::{Rgb, RgbImage};

use crate::detect::Detection;
use crate::frame::{AnnotatedFrame, Frame};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;
const STRIP_PADDING: i32 = 2;

pub const DEFAULT_EVENT_LABEL: &str = "pothole";
pub const DEFAULT_EVENT_THRESHOLD: f32 = 0.5;

#[derive(Clone, Debug)]
pub struct FrameAnnotator {
    event_label: String,
    threshold: f32,
}

impl FrameAnnotator {
    pub fn new(event_label: impl Into<String>, threshold: f32) -> Self {
        Self {
            event_label: event_label.into(),
            threshold,
        }
    }

    /// Label match ignores ASCII case; confidence must be strictly above the
    /// threshold.
    pub fn qualifies(&self, detection: &Detection) -> bool {
        detection.label().eq_ignore_ascii_case(&self.event_label)
            && detection.confidence() > self.threshold
    }

    pub fn annotate(&self, frame: &Frame, detections: Vec<Detection>) -> AnnotatedFrame {
        let has_qualifying_detection = detections.iter().any(|d| self.qualifies(d));

        let annotated = if detections.is_empty() {
            frame.clone().into_rgb()
        } else {
            match frame.to_rgb_image() {
                Some(mut image) => {
                    for detection in &detections {
                        draw_detection(&mut image, detection);
                    }
                    match Frame::from_rgb_image(image) {
                        Ok(annotated) => annotated,
                        Err(err) => {
                            log::warn!("FrameAnnotator: dropping overlays: {}", err);
                            frame.clone().into_rgb()
                        }
                    }
                }
                None => {
                    log::warn!(
                        "FrameAnnotator: {}x{} frame buffer unusable, dropping overlays",
                        frame.width,
                        frame.height
                    );
                    frame.clone().into_rgb()
                }
            }
        };

        AnnotatedFrame {
            frame: annotated,
            detections,
            has_qualifying_detection,
        }
    }
}

impl Default for FrameAnnotator {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_LABEL, DEFAULT_EVENT_THRESHOLD)
    }
}

fn draw_detection(image: &mut RgbImage, detection: &Detection) {
    let [x1, y1, x2, y2] = detection.bbox();
    let (left, right) = (x1.min(x2), x1.max(x2));
    let (top, bottom) = (y1.min(y2), y1.max(y2));

    for inset in 0..BOX_THICKNESS {
        draw_rectangle(
            image,
            left + inset,
            top + inset,
            right - inset,
            bottom - inset,
            BOX_COLOR,
        );
    }

    let text = format!("{} {:.2}", detection.label(), detection.confidence());
    let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
    let strip_height = GLYPH_HEIGHT + STRIP_PADDING * 2;
    // Above the box when there is room, otherwise just inside its top edge.
    let strip_top = if top - strip_height >= 0 {
        top - strip_height
    } else {
        top
    };
    fill_rect(
        image,
        left,
        strip_top,
        left + text_width + STRIP_PADDING,
        strip_top + strip_height - 1,
        BOX_COLOR,
    );
    draw_text(
        image,
        left + STRIP_PADDING,
        strip_top + STRIP_PADDING,
        &text,
        TEXT_COLOR,
    );
}

fn put_pixel(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if left > right || top > bottom {
        return;
    }
    for x in left..=right {
        put_pixel(image, x, top, color);
        put_pixel(image, x, bottom, color);
    }
    for y in top..=bottom {
        put_pixel(image, left, y, color);
        put_pixel(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let max_x = image.width() as i32 - 1;
    let max_y = image.height() as i32 - 1;
    for y in top.max(0)..=bottom.min(max_y) {
        for x in left.max(0)..=right.min(max_x) {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let mut pen = x;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        put_pixel(image, pen + col, y + row as i32, color);
                    }
                }
            }
        }
        pen += GLYPH_ADVANCE;
    }
}

/// 5x7 glyph rows, most significant of the low five bits is the left column.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        ' ' => [0x00; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: u32, height: u32) -> Frame {
        Frame::rgb(vec![128u8; (width * height * 3) as usize], width, height).unwrap()
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let offset = ((y * frame.width + x) * 3) as usize;
        let p = &frame.pixels()[offset..offset + 3];
        [p[0], p[1], p[2]]
    }

    #[test]
    fn qualifying_threshold_is_strict() {
        let annotator = FrameAnnotator::default();
        assert!(annotator.qualifies(&Detection::new([0, 0, 1, 1], "pothole", 0.62)));
        assert!(annotator.qualifies(&Detection::new([0, 0, 1, 1], "Pothole", 0.51)));
        assert!(!annotator.qualifies(&Detection::new([0, 0, 1, 1], "pothole", 0.40)));
        assert!(!annotator.qualifies(&Detection::new([0, 0, 1, 1], "pothole", 0.5)));
        assert!(!annotator.qualifies(&Detection::new([0, 0, 1, 1], "crack", 0.95)));
    }

    #[test]
    fn high_confidence_pothole_sets_flag_and_draws_box() {
        let frame = gray_frame(64, 48);
        let detection = Detection::new([10, 20, 40, 40], "pothole", 0.62);
        let annotated = FrameAnnotator::default().annotate(&frame, vec![detection]);

        assert!(annotated.has_qualifying_detection);
        assert_eq!(annotated.detections.len(), 1);
        assert_eq!((annotated.frame.width, annotated.frame.height), (64, 48));
        assert_eq!(pixel(&annotated.frame, 25, 40), [0, 255, 0]);
        assert_eq!(pixel(&annotated.frame, 11, 30), [0, 255, 0]);
        // interior untouched, input untouched
        assert_eq!(pixel(&annotated.frame, 25, 30), [128, 128, 128]);
        assert_eq!(pixel(&frame, 25, 40), [128, 128, 128]);
    }

    #[test]
    fn low_confidence_pothole_is_drawn_but_not_flagged() {
        let frame = gray_frame(64, 48);
        let detection = Detection::new([10, 20, 40, 40], "pothole", 0.40);
        let annotated = FrameAnnotator::default().annotate(&frame, vec![detection]);

        assert!(!annotated.has_qualifying_detection);
        assert_eq!(pixel(&annotated.frame, 25, 40), [0, 255, 0]);
    }

    #[test]
    fn boxes_outside_the_frame_are_clipped() {
        let frame = gray_frame(16, 16);
        let detection = Detection::new([-20, -20, 100, 100], "pothole", 0.9);
        let annotated = FrameAnnotator::default().annotate(&frame, vec![detection]);
        assert_eq!((annotated.frame.width, annotated.frame.height), (16, 16));
    }

    #[test]
    fn no_detections_passes_pixels_through() {
        let frame = gray_frame(8, 8);
        let annotated = FrameAnnotator::default().annotate(&frame, Vec::new());
        assert!(!annotated.has_qualifying_detection);
        assert_eq!(annotated.frame.pixels(), frame.pixels());
    }
}
