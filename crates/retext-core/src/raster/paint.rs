//! Painting replacement text onto page images

use super::ocr::PixelBox;
use crate::config::{RasterConfig, WidthPolicy};
use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect as PixelRect;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fonts tried in order when none is configured
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/truetype/freefont/FreeSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/noto/NotoSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/System/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Replacement glyph height relative to the word box
const HEIGHT_RATIO: f32 = 0.85;
const MIN_FONT_PX: f32 = 8.0;
const MIN_SHRUNK_PX: f32 = 4.0;

/// Luminance distance for a pixel to count as ink
const INK_CONTRAST: f64 = 80.0;

/// Result of painting one replacement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaintOutcome {
    pub font_px: f32,
    /// Drawn text width divided by the box width
    pub width_ratio: f64,
    pub shrunk: bool,
}

/// Draws text with a TrueType font when one can be loaded, else with a
/// built-in 5x7 bitmap face.
pub struct Painter {
    font: Option<FontVec>,
    source: Option<PathBuf>,
}

impl std::fmt::Debug for Painter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Painter")
            .field("source", &self.source)
            .finish()
    }
}

impl Painter {
    pub fn load(config: &RasterConfig) -> Self {
        if let Some(path) = &config.font_path {
            match load_font(path) {
                Some(font) => return Self::with_font(font, path.clone()),
                None => warn!(path = %path.display(), "configured font unusable, trying system fonts"),
            }
        }
        for candidate in SYSTEM_FONT_CANDIDATES {
            let path = Path::new(candidate);
            if let Some(font) = load_font(path) {
                return Self::with_font(font, path.to_path_buf());
            }
        }
        warn!("no TrueType font found, using bitmap glyphs");
        Self::bitmap()
    }

    pub fn bitmap() -> Self {
        Self {
            font: None,
            source: None,
        }
    }

    fn with_font(font: FontVec, source: PathBuf) -> Self {
        debug!(font = %source.display(), "loaded replacement font");
        Self {
            font: Some(font),
            source: Some(source),
        }
    }

    pub fn has_truetype(&self) -> bool {
        self.font.is_some()
    }

    /// Width in pixels of `text` at `px`
    pub fn text_width(&self, text: &str, px: f32) -> f32 {
        match &self.font {
            Some(font) => {
                let scaled = font.as_scaled(PxScale::from(px));
                let mut width = 0.0;
                let mut previous = None;
                for c in text.chars() {
                    let id = scaled.glyph_id(c);
                    if let Some(prev) = previous {
                        width += scaled.kern(prev, id);
                    }
                    width += scaled.h_advance(id);
                    previous = Some(id);
                }
                width
            }
            None => text.chars().count() as f32 * BITMAP_CELL as f32 * bitmap_scale(px) as f32,
        }
    }

    /// Cover `area` with its surrounding background color and draw `text`
    /// anchored at the box's top-left corner.
    pub fn paint(
        &self,
        image: &mut RgbImage,
        area: PixelBox,
        text: &str,
        policy: WidthPolicy,
    ) -> PaintOutcome {
        let background = background_color(image, area);
        let ink = ink_color(image, area, background);

        if area.width > 0 && area.height > 0 {
            draw_filled_rect_mut(
                image,
                PixelRect::at(area.left as i32, area.top as i32).of_size(area.width, area.height),
                background,
            );
        }

        let mut px = (area.height as f32 * HEIGHT_RATIO).max(MIN_FONT_PX);
        let mut width = self.text_width(text, px);
        let box_width = area.width.max(1) as f32;
        let mut shrunk = false;
        if policy == WidthPolicy::ShrinkToFit && width > box_width {
            px = (px * box_width / width).max(MIN_SHRUNK_PX);
            width = self.text_width(text, px);
            shrunk = true;
        }

        match &self.font {
            Some(font) => draw_text_mut(
                image,
                ink,
                area.left as i32,
                area.top as i32,
                PxScale::from(px),
                font,
                text,
            ),
            None => draw_bitmap_text(image, ink, area, text, px),
        }

        PaintOutcome {
            font_px: px,
            width_ratio: (width / box_width) as f64,
            shrunk,
        }
    }
}

fn load_font(path: &Path) -> Option<FontVec> {
    let bytes = std::fs::read(path).ok()?;
    FontVec::try_from_vec(bytes).ok()
}

fn luminance(p: Rgb<u8>) -> f64 {
    0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64
}

fn most_common(pixels: impl Iterator<Item = Rgb<u8>>) -> Option<Rgb<u8>> {
    let mut counts: BTreeMap<[u8; 3], usize> = BTreeMap::new();
    for p in pixels {
        *counts.entry(p.0).or_default() += 1;
    }
    // BTreeMap iteration keeps ties deterministic (lowest color wins)
    let mut best: Option<([u8; 3], usize)> = None;
    for (color, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((color, count));
        }
    }
    best.map(|(color, _)| Rgb(color))
}

/// Most common color on the one-pixel ring just outside `area`.
pub fn background_color(image: &RgbImage, area: PixelBox) -> Rgb<u8> {
    let (w, h) = image.dimensions();
    let mut ring = Vec::new();
    let left = area.left as i64 - 1;
    let right = area.right() as i64;
    let top = area.top as i64 - 1;
    let bottom = area.bottom() as i64;
    let inside = |x: i64, y: i64| x >= 0 && y >= 0 && x < w as i64 && y < h as i64;

    for x in left..=right {
        for y in [top, bottom] {
            if inside(x, y) {
                ring.push(*image.get_pixel(x as u32, y as u32));
            }
        }
    }
    for y in (top + 1)..bottom {
        for x in [left, right] {
            if inside(x, y) {
                ring.push(*image.get_pixel(x as u32, y as u32));
            }
        }
    }
    most_common(ring.into_iter()).unwrap_or(Rgb([255, 255, 255]))
}

/// Most common pixel inside `area` that contrasts with `background`.
pub fn ink_color(image: &RgbImage, area: PixelBox, background: Rgb<u8>) -> Rgb<u8> {
    let (w, h) = image.dimensions();
    let bg = luminance(background);
    let pixels = (area.top..area.bottom().min(h)).flat_map(|y| {
        (area.left..area.right().min(w)).map(move |x| *image.get_pixel(x, y))
    });
    most_common(pixels.filter(|p| (luminance(*p) - bg).abs() >= INK_CONTRAST)).unwrap_or(
        if bg < 128.0 {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        },
    )
}

const BITMAP_CELL: u32 = 6;
const BITMAP_ROWS: u32 = 7;

fn bitmap_scale(px: f32) -> u32 {
    ((px / (BITMAP_ROWS + 1) as f32).floor() as u32).max(1)
}

fn draw_bitmap_text(image: &mut RgbImage, ink: Rgb<u8>, area: PixelBox, text: &str, px: f32) {
    let scale = bitmap_scale(px);
    let (w, h) = image.dimensions();
    // Vertically centered in the box
    let glyph_height = BITMAP_ROWS * scale;
    let top = area.top + area.height.saturating_sub(glyph_height) / 2;

    for (i, c) in text.chars().enumerate() {
        let rows = bitmap_glyph(c);
        let origin_x = area.left + i as u32 * BITMAP_CELL * scale;
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..5u32 {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let x = origin_x + col * scale + dx;
                        let y = top + row as u32 * scale + dy;
                        if x < w && y < h {
                            image.put_pixel(x, y, ink);
                        }
                    }
                }
            }
        }
    }
}

/// 5x7 glyph rows, bit 4 is the leftmost column. Lowercase letters use the
/// uppercase shapes; unknown characters draw as '?'.
fn bitmap_glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        ' ' => [0; 7],
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
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
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
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '\'' => [0x0C, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        '!' => [0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '+' => [0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        '$' => [0x04, 0x0F, 0x14, 0x0E, 0x05, 0x1E, 0x04],
        '&' => [0x0C, 0x12, 0x14, 0x08, 0x15, 0x12, 0x0D],
        '@' => [0x0E, 0x11, 0x01, 0x0D, 0x15, 0x15, 0x0E],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}
