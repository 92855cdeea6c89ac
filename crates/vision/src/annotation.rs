//! Drawing detections, the FPS readout, and the waiting placeholder.
//!
//! Text uses a built-in 5x7 bitmap font so no font files need to ship with the
//! binary. Lowercase input is drawn in uppercase.

use image::{ImageBuffer, Rgb, RgbImage};
use ml_core::FrameResult;
use video_ingest::{Frame, FrameFormat};

use crate::{
    counters::{Bucket, CounterRules},
    data::AnnotatedFrame,
    error::FrameProcessingError,
};

pub const PLACEHOLDER_MESSAGE: &str = "Waiting for camera...";

const HELMET_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const VEST_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const VIOLATION_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const OTHER_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;
const BOX_THICKNESS: i32 = 2;

pub fn bucket_color(bucket: Option<Bucket>) -> Rgb<u8> {
    match bucket {
        Some(Bucket::Helmet) => HELMET_COLOR,
        Some(Bucket::Vest) => VEST_COLOR,
        Some(Bucket::Violation) => VIOLATION_COLOR,
        None => OTHER_COLOR,
    }
}

/// Copy a captured BGR frame into a new RGB image.
pub fn frame_to_image(frame: &Frame) -> Result<RgbImage, FrameProcessingError> {
    if !frame.is_complete() {
        return Err(FrameProcessingError::InvalidFrame(format!(
            "{} bytes for a {}x{} frame",
            frame.data.len(),
            frame.width,
            frame.height
        )));
    }
    let rgb = match frame.format {
        FrameFormat::Bgr8 => frame
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect::<Vec<u8>>(),
    };
    ImageBuffer::from_raw(frame.width as u32, frame.height as u32, rgb).ok_or_else(|| {
        FrameProcessingError::InvalidFrame("buffer does not match frame geometry".into())
    })
}

/// Draw boxes, labels and the FPS readout onto a copy of `frame`.
pub fn annotate(
    frame: &Frame,
    result: &FrameResult,
    rules: &CounterRules,
    fps: f32,
) -> Result<AnnotatedFrame, FrameProcessingError> {
    let mut image = frame_to_image(frame)?;

    for det in &result.detections {
        let Some(bbox) = det.bounding_box else {
            continue;
        };
        let color = bucket_color(rules.classify(&det.label));
        let (left, top) = (bbox.x1.round() as i32, bbox.y1.round() as i32);
        let (right, bottom) = (bbox.x2.round() as i32, bbox.y2.round() as i32);
        draw_rectangle(&mut image, left, top, right, bottom, BOX_THICKNESS, color);

        let label = format!("{} {:.2}", det.label, det.confidence);
        let label_y = (top - GLYPH_HEIGHT - 5).max(0);
        fill_rect(
            &mut image,
            left,
            label_y,
            left + text_width(&label, 1) + 2,
            label_y + GLYPH_HEIGHT + 2,
            LABEL_BACKGROUND,
        );
        draw_text(&mut image, left + 1, label_y + 1, &label, 1, color);
    }

    let info = format!("FPS: {fps:.1}");
    fill_rect(
        &mut image,
        6,
        6,
        10 + text_width(&info, 2) + 2,
        10 + GLYPH_HEIGHT * 2 + 2,
        LABEL_BACKGROUND,
    );
    draw_text(&mut image, 10, 10, &info, 2, HELMET_COLOR);

    Ok(AnnotatedFrame {
        image,
        frame_number: result.frame_number,
        timestamp_ms: frame.timestamp_ms,
        fps,
    })
}

/// Neutral frame with a centred message, served before any frame exists.
pub fn placeholder_frame(width: u32, height: u32, message: &str) -> AnnotatedFrame {
    let mut image = RgbImage::new(width.max(1), height.max(1));
    let scale = if width >= 480 { 3 } else { 1 };
    let text_w = text_width(message, scale);
    let x = ((width as i32 - text_w) / 2).max(0);
    let y = ((height as i32 - GLYPH_HEIGHT * scale) / 2).max(0);
    draw_text(&mut image, x, y, message, scale, TEXT_COLOR);
    AnnotatedFrame {
        image,
        frame_number: 0,
        timestamp_ms: 0,
        fps: 0.0,
    }
}

/// Rendered width in pixels of `text` at `scale`.
pub fn text_width(text: &str, scale: i32) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE * scale
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
    thickness: i32,
    color: Rgb<u8>,
) {
    for inset in 0..thickness {
        let (l, t, r, b) = (left + inset, top + inset, right - inset, bottom - inset);
        if l > r || t > b {
            break;
        }
        for x in l..=r {
            put_pixel(image, x, t, color);
            put_pixel(image, x, b, color);
        }
        for y in t..=b {
            put_pixel(image, l, y, color);
            put_pixel(image, r, y, color);
        }
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width);
    let right = right.clamp(0, width);
    let top = top.clamp(0, height);
    let bottom = bottom.clamp(0, height);
    for y in top..bottom {
        for x in left..right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    let mut cursor = x;
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            put_pixel(
                                image,
                                cursor + col * scale + dx,
                                y + row as i32 * scale + dy,
                                color,
                            );
                        }
                    }
                }
            }
        }
        cursor += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ',' => [0, 0, 0, 0, 0b00110, 0b00100, 0b01000],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '+' => [0, 0b00100, 0b00100, 0b11111, 0b00100, 0b00100, 0],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0, 0b00100],
        '?' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0, 0b00100],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
