//! Text runs from the structured text layer of a page
//!
//! A page is *structured* when its content stream decodes, shows at least one
//! visible character, and the decoded text passes the quality check. Any
//! [`ExtractionError`] marks the page unusable, which routes it to OCR.

mod cmap;
mod font;
mod interpreter;
pub mod quality;

pub use font::FontInfo;

use crate::error::ExtractionError;
use crate::geometry::{Color, Rect};
use interpreter::Interpreter;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::BTreeMap;
use tracing::debug;

/// Where a glyph lives in the content stream
#[derive(Debug, Clone, PartialEq)]
pub struct GlyphRef {
    /// Operand index of the string (or TJ array) within the operator
    pub operand: usize,
    /// Element index inside a TJ array; `None` for a plain string operand
    pub element: Option<usize>,
    pub byte_start: usize,
    pub byte_end: usize,
    /// Horizontal displacement of the glyph in thousandths of text space,
    /// including character and word spacing
    pub advance_units: f64,
}

/// One character of a run with its horizontal extent in user space
#[derive(Debug, Clone, PartialEq)]
pub struct RunChar {
    pub ch: char,
    pub x0: f64,
    pub x1: f64,
    /// Index into [`TextRun::glyphs`]
    pub glyph: usize,
}

/// A contiguous text fragment shown by one operator
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    /// Index of the showing operator in the page's operation list
    pub op_index: usize,
    pub text: String,
    pub chars: Vec<RunChar>,
    pub glyphs: Vec<GlyphRef>,
    pub baseline: f64,
    pub font_resource: String,
    pub base_font: String,
    pub standard_font: &'static str,
    /// Size in user space (Tf size scaled by text and graphics matrices)
    pub font_size: f64,
    /// Size operand of the active `Tf`
    pub text_font_size: f64,
    pub color: Color,
    pub line: usize,
    /// Every glyph advance came from the font dictionary or an exact table
    pub exact_metrics: bool,
    /// Upright, unrotated text
    pub axis_aligned: bool,
}

impl TextRun {
    pub fn x0(&self) -> f64 {
        self.chars.first().map(|c| c.x0).unwrap_or(0.0)
    }

    pub fn x1(&self) -> f64 {
        self.chars.last().map(|c| c.x1).unwrap_or(0.0)
    }

    /// Box around characters `start..end` from descender to ascender.
    pub fn char_box(&self, start: usize, end: usize) -> Rect {
        let x0 = self.chars.get(start).map(|c| c.x0).unwrap_or(0.0);
        let x1 = end
            .checked_sub(1)
            .and_then(|i| self.chars.get(i))
            .map(|c| c.x1)
            .unwrap_or(x0);
        Rect::new(
            x0,
            self.baseline - DESCENT * self.font_size,
            x1,
            self.baseline + ASCENT * self.font_size,
        )
    }
}

/// Share of the font size above the baseline covered when erasing text
pub const ASCENT: f64 = 0.9;
/// Share of the font size below the baseline covered when erasing text
pub const DESCENT: f64 = 0.25;

/// A rectangle painted with a fill operator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilledRect {
    pub rect: Rect,
    pub color: Color,
    pub op_index: usize,
}

/// Everything the vector path needs to know about one page
#[derive(Debug, Clone)]
pub struct PageText {
    /// 1-based
    pub page_number: u32,
    pub page_id: ObjectId,
    pub media_box: Rect,
    pub operations: Vec<Operation>,
    /// Ordered top-to-bottom, then left-to-right
    pub runs: Vec<TextRun>,
    pub fills: Vec<FilledRect>,
    pub font_resources: Vec<String>,
}

impl PageText {
    /// Fill color of the last rectangle painted before `op_index` that covers
    /// `area`.
    pub fn background_at(&self, area: &Rect, op_index: usize) -> Option<Color> {
        self.fills
            .iter()
            .filter(|f| f.op_index < op_index && f.rect.contains(area, 0.5))
            .last()
            .map(|f| f.color)
    }

    pub fn text(&self) -> String {
        let mut out = String::new();
        let mut line = None;
        for run in &self.runs {
            if line.is_some() && line != Some(run.line) {
                out.push('\n');
            } else if line.is_some() {
                out.push(' ');
            }
            out.push_str(&run.text);
            line = Some(run.line);
        }
        out
    }
}

/// Extract text runs from a page.
///
/// Only the page's own content stream is read. Text drawn inside Form
/// XObjects (`Do`) is not extracted; a page whose only text lives in forms
/// reports [`ExtractionError::NoTextLayer`] and is edited through OCR.
pub fn extract_page(
    doc: &Document,
    page_number: u32,
    page_id: ObjectId,
) -> Result<PageText, ExtractionError> {
    let content = doc
        .get_page_content(page_id)
        .map_err(|e| ExtractionError::ContentUnreadable(e.to_string()))?;
    let operations = Content::decode(&content)
        .map_err(|e| ExtractionError::ContentUnreadable(e.to_string()))?
        .operations;

    let fonts = page_fonts(doc, page_id);
    let (mut runs, fills) = Interpreter::new(&fonts).run(&operations);

    let visible: String = runs.iter().map(|r| r.text.as_str()).collect();
    let census = quality::check_text_layer(&visible)?;

    assign_lines(&mut runs);
    debug!(
        page = page_number,
        runs = runs.len(),
        glyphs = census.visible,
        fills = fills.len(),
        "Extracted text layer"
    );

    Ok(PageText {
        page_number,
        page_id,
        media_box: media_box(doc, page_id),
        operations,
        runs,
        fills,
        font_resources: fonts.into_keys().collect(),
    })
}

/// Group runs into lines by baseline and order them for reading.
fn assign_lines(runs: &mut [TextRun]) {
    runs.sort_by(|a, b| {
        b.baseline
            .total_cmp(&a.baseline)
            .then(a.x0().total_cmp(&b.x0()))
            .then(a.op_index.cmp(&b.op_index))
    });

    let mut line = 0;
    let mut line_baseline: Option<f64> = None;
    let mut line_size = 0.0f64;
    for run in runs.iter_mut() {
        if let Some(base) = line_baseline {
            let tolerance = 0.3 * line_size.min(run.font_size).max(1.0);
            if (base - run.baseline).abs() > tolerance {
                line += 1;
                line_baseline = Some(run.baseline);
                line_size = run.font_size;
            }
        } else {
            line_baseline = Some(run.baseline);
            line_size = run.font_size;
        }
        run.line = line;
    }

    // Within a line, order strictly by horizontal position
    runs.sort_by(|a, b| {
        a.line
            .cmp(&b.line)
            .then(a.x0().total_cmp(&b.x0()))
            .then(a.op_index.cmp(&b.op_index))
    });
}

fn page_fonts(doc: &Document, page_id: ObjectId) -> BTreeMap<String, FontInfo> {
    let mut fonts = BTreeMap::new();
    let Some(resources) = page_resources(doc, page_id) else {
        return fonts;
    };
    let Some(font_dict) = resources
        .get(b"Font")
        .ok()
        .and_then(|o| font::resolve(doc, o).as_dict().ok())
    else {
        return fonts;
    };
    for (name, obj) in font_dict.iter() {
        if let Ok(dict) = font::resolve(doc, obj).as_dict() {
            fonts.insert(
                String::from_utf8_lossy(name).into_owned(),
                FontInfo::from_dict(doc, dict),
            );
        }
    }
    fonts
}

/// Look up a key on the page, walking up the page tree via /Parent.
pub(crate) fn resolve_inherited<'a>(
    doc: &'a Document,
    page_id: ObjectId,
    key: &[u8],
) -> Option<&'a Object> {
    let mut current = page_id;
    // Bounded walk; malformed trees can loop
    for _ in 0..64 {
        let dict = doc.get_object(current).and_then(|o| o.as_dict()).ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(value);
        }
        current = dict.get(b"Parent").and_then(|p| p.as_reference()).ok()?;
    }
    None
}

pub(crate) fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let obj = resolve_inherited(doc, page_id, b"Resources")?;
    font::resolve(doc, obj).as_dict().ok()
}

/// Page MediaBox, US Letter when missing.
pub fn media_box(doc: &Document, page_id: ObjectId) -> Rect {
    resolve_inherited(doc, page_id, b"MediaBox")
        .and_then(|o| font::resolve(doc, o).as_array().ok())
        .and_then(|arr| {
            let v: Vec<f64> = arr.iter().filter_map(|o| font::number(doc, o)).collect();
            match v[..] {
                [x0, y0, x1, y1] => Some(Rect::new(x0, y0, x1, y1)),
                _ => None,
            }
        })
        .unwrap_or(Rect::new(0.0, 0.0, 612.0, 792.0))
}

/// Page /Rotate normalized to 0, 90, 180 or 270.
pub fn page_rotation(doc: &Document, page_id: ObjectId) -> i64 {
    resolve_inherited(doc, page_id, b"Rotate")
        .and_then(|o| font::number(doc, o))
        .map(|r| ((r as i64 % 360) + 360) % 360 / 90 * 90)
        .unwrap_or(0)
}
