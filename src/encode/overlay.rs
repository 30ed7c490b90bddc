//! Observability overlay: class-coloured boxes, labels and the quality HUD.

use image::{Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::config::QualityProfile;
use crate::frame::Detection;

const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const LABEL_PAD: i32 = 2;

const PALETTE: [[u8; 3]; 10] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [250, 190, 190],
];

/// Stable palette colour for a class name.
pub fn class_color(class: &str) -> Rgb<u8> {
    let digest = Sha256::digest(class.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let index = (u64::from_be_bytes(head) % PALETTE.len() as u64) as usize;
    Rgb(PALETTE[index])
}

/// Box outline plus a filled `CLASS 0.87` tag above it (inside the box when
/// there is no room above).
pub fn draw_detection(image: &mut RgbImage, detection: &Detection) {
    let bbox = detection.bbox;
    if bbox.width == 0 || bbox.height == 0 {
        return;
    }
    let color = class_color(&detection.class);
    let left = bbox.x as i32;
    let top = bbox.y as i32;
    let right = bbox.right() as i32 - 1;
    let bottom = bbox.bottom() as i32 - 1;
    draw_rectangle(image, left, top, right, bottom, color);

    let label = format!("{} {:.2}", detection.class, detection.confidence);
    let text_width = text_width(&label);
    let tag_height = GLYPH_HEIGHT + LABEL_PAD * 2;
    let tag_top = if top >= tag_height { top - tag_height } else { top };
    fill_rect(
        image,
        left,
        tag_top,
        left + text_width + LABEL_PAD * 2 - 1,
        tag_top + tag_height - 1,
        color,
    );
    draw_label(
        image,
        left + LABEL_PAD,
        tag_top + LABEL_PAD,
        &label,
        contrast_for(color),
    );
}

/// `ROI QP n` and `BG QP m` in the top-left corner.
pub fn draw_quality_hud(image: &mut RgbImage, quality: QualityProfile) {
    let lines = [
        format!("ROI QP {}", quality.roi_qp()),
        format!("BG QP {}", quality.background_qp()),
    ];
    let line_height = GLYPH_HEIGHT + LABEL_PAD * 2;
    for (row, line) in lines.iter().enumerate() {
        let y = row as i32 * line_height;
        fill_rect(
            image,
            0,
            y,
            text_width(line) + LABEL_PAD * 2 - 1,
            y + line_height - 1,
            Rgb([0, 0, 0]),
        );
        draw_label(image, LABEL_PAD, y + LABEL_PAD, line, Rgb([255, 255, 255]));
    }
}

fn text_width(text: &str) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE
}

fn contrast_for(color: Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = color.0;
    let luma = r as u32 * 299 + g as u32 * 587 + b as u32 * 114;
    if luma > 128_000 {
        Rgb([0, 0, 0])
    } else {
        Rgb([255, 255, 255])
    }
}

fn put(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
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
    for x in left..=right {
        put(image, x, top, color);
        put(image, x, bottom, color);
    }
    for y in top..=bottom {
        put(image, left, y, color);
        put(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let left = left.max(0);
    let top = top.max(0);
    let right = right.min(image.width() as i32 - 1);
    let bottom = bottom.min(image.height() as i32 - 1);
    for y in top..=bottom {
        for x in left..=right {
            put(image, x, y, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put(image, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
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
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
