//! Vector mutator
//!
//! Replaces text on pages with a usable text layer. Work is split in two:
//!
//! * [`plan_page`] reads a shared, immutable document, locates matches and
//!   computes the rewritten operator list. Pages are planned in parallel.
//! * [`VectorWriter::apply`] writes a plan back into the document. Only one
//!   owner applies plans, in page order, so output bytes are deterministic.
//!
//! Each replacement covers the old text with a rectangle in the background
//! color and draws the new text with a standard font at the old baseline.
//! When the glyph advances of the run are known exactly the matched glyphs are
//! also removed from the showing operator, with a compensating `TJ`
//! displacement so that the remaining glyphs do not move.

use crate::config::{VectorConfig, WidthPolicy, OVERFLOW_NOTE_RATIO};
use crate::directive::DirectiveSet;
use crate::error::{ExtractionError, MutationError};
use crate::extraction::{extract_page, PageText, TextRun};
use crate::fonts;
use crate::geometry::{Color, Rect};
use crate::locator::{locate, MatchSpan, RunSlice, SpanSource};
use crate::report::{NoteKind, ReportContribution};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Smallest size text is shrunk to under [`WidthPolicy::ShrinkToFit`]
const MIN_SHRUNK_SIZE: f64 = 4.0;

/// Rewritten content for one page, ready to be written back
#[derive(Debug, Clone)]
pub struct PagePlan {
    pub page_number: u32,
    pub page_id: ObjectId,
    operations: Vec<Operation>,
    /// Resource name to standard font
    fonts: BTreeMap<String, &'static str>,
    pub contribution: ReportContribution,
    pub replacements: usize,
}

impl PagePlan {
    /// A plan that leaves the page untouched
    pub fn is_noop(&self) -> bool {
        self.replacements == 0
    }
}

/// Analyze a page and compute its edits.
///
/// Fails only when the page has no usable text layer; a structured page
/// without matches yields an empty plan.
pub fn plan_page(
    doc: &Document,
    page_number: u32,
    page_id: ObjectId,
    directives: &DirectiveSet,
    config: &VectorConfig,
) -> Result<PagePlan, ExtractionError> {
    let page = extract_page(doc, page_number, page_id)?;
    let located = locate(&page, directives);

    let mut contribution = ReportContribution::new();
    for note in &located.notes {
        contribution.note(page_number, NoteKind::Ambiguity, note.clone());
    }

    if located.spans.is_empty() {
        return Ok(PagePlan {
            page_number,
            page_id,
            operations: Vec::new(),
            fonts: BTreeMap::new(),
            contribution,
            replacements: 0,
        });
    }

    let mut fonts: BTreeMap<String, &'static str> = BTreeMap::new();
    let mut overlay = Vec::new();
    for span in &located.spans {
        let Some(directive) = directives.get(span.directive) else {
            continue;
        };
        let SpanSource::Runs(slices) = &span.source else {
            continue;
        };
        let Some(first) = slices.first().map(|s| &page.runs[s.run]) else {
            continue;
        };

        let standard = first.standard_font;
        let resource = font_resource_for(&page, &mut fonts, standard);
        let edit = SpanEdit::new(&page, span, first, directive.replacement(), config);
        edit.note_into(&mut contribution, page_number, directive.original(), directive.replacement());
        overlay.extend(edit.operations(&resource, directive.replacement()));
        contribution.record_vector(span.directive, 1);
    }

    let stripped = if config.strip_original_glyphs {
        strip_matched_glyphs(&page, &located.spans)
    } else {
        BTreeMap::new()
    };

    let mut operations = Vec::with_capacity(page.operations.len() + overlay.len() + 2);
    operations.push(Operation::new("q", vec![]));
    for (index, op) in page.operations.iter().enumerate() {
        match stripped.get(&index) {
            Some(replacement) => operations.extend(replacement.iter().cloned()),
            None => operations.push(op.clone()),
        }
    }
    operations.push(Operation::new("Q", vec![]));
    operations.extend(overlay);

    let replacements = located.spans.len();
    debug!(
        page = page_number,
        replacements,
        stripped_ops = stripped.len(),
        "Planned vector edits"
    );

    Ok(PagePlan {
        page_number,
        page_id,
        operations,
        fonts,
        contribution,
        replacements,
    })
}

/// Resource name for a standard font.
///
/// The name depends only on the font and on the names the page already
/// uses, so pages sharing a resource dictionary agree on every entry they
/// add to it.
fn font_resource_for(
    page: &PageText,
    fonts: &mut BTreeMap<String, &'static str>,
    standard: &'static str,
) -> String {
    if let Some((name, _)) = fonts.iter().find(|(_, s)| **s == standard) {
        return name.clone();
    }
    let base = format!("RtF-{}", standard);
    let mut candidate = base.clone();
    let mut n = 1;
    while page.font_resources.contains(&candidate) {
        n += 1;
        candidate = format!("{}-{}", base, n);
    }
    fonts.insert(candidate.clone(), standard);
    candidate
}

/// Overlay geometry and styling for one span
struct SpanEdit {
    cover: Rect,
    background: Color,
    origin: (f64, f64),
    size: f64,
    color: Color,
    text: Vec<u8>,
    unencodable: Vec<char>,
    overflow: Option<f64>,
    shrunk_from: Option<f64>,
}

impl SpanEdit {
    fn new(
        page: &PageText,
        span: &MatchSpan,
        first: &TextRun,
        replacement: &str,
        config: &VectorConfig,
    ) -> Self {
        let background = page
            .background_at(&span.bbox, first.op_index)
            .unwrap_or(config.default_background);
        let original_width = span.bbox.width();
        let (text, unencodable) = fonts::encode_win_ansi_lossy(replacement);

        let mut size = first.font_size;
        let units = fonts::text_width_units(first.standard_font, replacement);
        let replacement_width = units / 1000.0 * size;

        let mut overflow = None;
        let mut shrunk_from = None;
        if original_width > 0.0 && replacement_width > original_width {
            match config.width_policy {
                WidthPolicy::KeepSize => {
                    let ratio = replacement_width / original_width;
                    if ratio > OVERFLOW_NOTE_RATIO {
                        overflow = Some(ratio);
                    }
                }
                WidthPolicy::ShrinkToFit => {
                    let fitted = (size * original_width / replacement_width).max(MIN_SHRUNK_SIZE);
                    shrunk_from = Some(size);
                    size = fitted;
                }
            }
        }

        Self {
            cover: span.bbox.expand(config.cover_padding),
            background,
            origin: (span.bbox.x0, first.baseline),
            size,
            color: first.color,
            text,
            unencodable,
            overflow,
            shrunk_from,
        }
    }

    fn note_into(
        &self,
        contribution: &mut ReportContribution,
        page: u32,
        original: &str,
        replacement: &str,
    ) {
        if let Some(ratio) = self.overflow {
            contribution.note(
                page,
                NoteKind::Overflow,
                format!(
                    "'{}' is {:.0}% wider than '{}' and may overlap neighbouring text",
                    replacement,
                    (ratio - 1.0) * 100.0,
                    original
                ),
            );
        }
        if let Some(from) = self.shrunk_from {
            contribution.note(
                page,
                NoteKind::Shrunk,
                format!(
                    "'{}' drawn at {:.1}pt instead of {:.1}pt to fit",
                    replacement, self.size, from
                ),
            );
        }
        if !self.unencodable.is_empty() {
            let chars: String = self.unencodable.iter().collect();
            contribution.note(
                page,
                NoteKind::Unencodable,
                format!(
                    "Characters '{}' in '{}' are not available in the standard font and were drawn as '?'",
                    chars, replacement
                ),
            );
        }
    }

    fn operations(&self, font_resource: &str, replacement: &str) -> Vec<Operation> {
        let bg = self.background;
        let mut ops = vec![
            Operation::new("q", vec![]),
            Operation::new("rg", vec![real(bg.r), real(bg.g), real(bg.b)]),
            Operation::new(
                "re",
                vec![
                    real(self.cover.x0),
                    real(self.cover.y0),
                    real(self.cover.width()),
                    real(self.cover.height()),
                ],
            ),
            Operation::new("f", vec![]),
            Operation::new("Q", vec![]),
        ];
        if replacement.is_empty() {
            return ops;
        }
        let c = self.color;
        ops.extend([
            Operation::new("BT", vec![]),
            Operation::new(
                "Tf",
                vec![Object::Name(font_resource.as_bytes().to_vec()), real(self.size)],
            ),
            Operation::new("rg", vec![real(c.r), real(c.g), real(c.b)]),
            Operation::new(
                "Tm",
                vec![
                    real(1.0),
                    real(0.0),
                    real(0.0),
                    real(1.0),
                    real(self.origin.0),
                    real(self.origin.1),
                ],
            ),
            Operation::new(
                "Tj",
                vec![Object::String(self.text.clone(), StringFormat::Hexadecimal)],
            ),
            Operation::new("ET", vec![]),
        ]);
        ops
    }
}

fn real(v: f64) -> Object {
    Object::Real(((v * 1000.0).round() / 1000.0) as f32)
}

/// Rewrite showing operators so that matched glyphs are no longer drawn.
///
/// Returns replacement operator lists keyed by operator index. Runs with
/// inexact metrics, or where a match splits a multi-character glyph, are
/// left alone; the cover rectangle hides them.
fn strip_matched_glyphs(page: &PageText, spans: &[MatchSpan]) -> BTreeMap<usize, Vec<Operation>> {
    // Matched characters per run
    let mut matched: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for span in spans {
        if let SpanSource::Runs(slices) = &span.source {
            for RunSlice { run, start, end } in slices.iter().copied() {
                matched.entry(run).or_default().extend(start..end);
            }
        }
    }

    let mut out = BTreeMap::new();
    for (run_index, chars) in matched {
        let run = &page.runs[run_index];
        if !run.exact_metrics || run.text_font_size.abs() < f64::EPSILON {
            continue;
        }
        let Some(removed) = removable_glyphs(run, &chars) else {
            continue;
        };
        let Some(op) = page.operations.get(run.op_index) else {
            continue;
        };
        if let Some(rewritten) = rewrite_operation(op, run, &removed) {
            out.insert(run.op_index, rewritten);
        }
    }
    out
}

/// Glyph indices whose characters are all matched, or `None` when some glyph
/// is only partly matched.
fn removable_glyphs(run: &TextRun, chars: &BTreeSet<usize>) -> Option<BTreeSet<usize>> {
    let mut per_glyph: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (i, rc) in run.chars.iter().enumerate() {
        let entry = per_glyph.entry(rc.glyph).or_default();
        entry.1 += 1;
        if chars.contains(&i) {
            entry.0 += 1;
        }
    }
    let mut removed = BTreeSet::new();
    for (glyph, (hit, total)) in per_glyph {
        if hit == total {
            removed.insert(glyph);
        } else if hit > 0 {
            return None;
        }
    }
    Some(removed)
}

/// Build a TJ array from string `bytes`, dropping removed glyphs and
/// replacing each with a displacement equal to its advance.
fn split_string(
    bytes: &[u8],
    format: &StringFormat,
    glyphs: &[(usize, usize, f64, bool)],
    out: &mut Vec<Object>,
) {
    let mut kept: Vec<u8> = Vec::new();
    let mut pending_shift = 0.0;
    for &(start, end, advance, removed) in glyphs {
        let Some(code) = bytes.get(start..end) else {
            continue;
        };
        if removed {
            if !kept.is_empty() {
                out.push(Object::String(std::mem::take(&mut kept), format.clone()));
            }
            pending_shift -= advance;
        } else {
            if pending_shift != 0.0 {
                out.push(real(pending_shift));
                pending_shift = 0.0;
            }
            kept.extend_from_slice(code);
        }
    }
    if !kept.is_empty() {
        out.push(Object::String(kept, format.clone()));
    }
    if pending_shift != 0.0 {
        out.push(real(pending_shift));
    }
}

/// Glyphs of `run` living in the given operand/element, as
/// `(byte_start, byte_end, advance_units, removed)`.
fn glyphs_in(
    run: &TextRun,
    removed: &BTreeSet<usize>,
    operand: usize,
    element: Option<usize>,
) -> Vec<(usize, usize, f64, bool)> {
    run.glyphs
        .iter()
        .enumerate()
        .filter(|(_, g)| g.operand == operand && g.element == element)
        .map(|(i, g)| (g.byte_start, g.byte_end, g.advance_units, removed.contains(&i)))
        .collect()
}

fn rewrite_operation(
    op: &Operation,
    run: &TextRun,
    removed: &BTreeSet<usize>,
) -> Option<Vec<Operation>> {
    if removed.is_empty() {
        return None;
    }
    match op.operator.as_str() {
        "Tj" | "'" | "\"" => {
            let operand = if op.operator == "\"" { 2 } else { 0 };
            let Some(Object::String(bytes, format)) = op.operands.get(operand) else {
                return None;
            };
            let mut array = Vec::new();
            split_string(bytes, format, &glyphs_in(run, removed, operand, None), &mut array);
            let tj = Operation::new("TJ", vec![Object::Array(array)]);
            Some(match op.operator.as_str() {
                "Tj" => vec![tj],
                "'" => vec![Operation::new("T*", vec![]), tj],
                _ => vec![
                    Operation::new("Tw", vec![op.operands.first()?.clone()]),
                    Operation::new("Tc", vec![op.operands.get(1)?.clone()]),
                    Operation::new("T*", vec![]),
                    tj,
                ],
            })
        }
        "TJ" => {
            let Some(Object::Array(items)) = op.operands.first() else {
                return None;
            };
            let mut array = Vec::with_capacity(items.len() + 4);
            for (element, item) in items.iter().enumerate() {
                match item {
                    Object::String(bytes, format) => split_string(
                        bytes,
                        format,
                        &glyphs_in(run, removed, 0, Some(element)),
                        &mut array,
                    ),
                    other => array.push(other.clone()),
                }
            }
            Some(vec![Operation::new("TJ", vec![Object::Array(array)])])
        }
        _ => None,
    }
}

/// Writes page plans into a document. Standard font objects are shared
/// between pages.
#[derive(Debug, Default)]
pub struct VectorWriter {
    font_objects: BTreeMap<&'static str, ObjectId>,
}

impl VectorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one page plan. Returns the number of replacements materialized.
    pub fn apply(&mut self, doc: &mut Document, plan: &PagePlan) -> Result<usize, MutationError> {
        if plan.is_noop() {
            return Ok(0);
        }

        let content = Content {
            operations: plan.operations.clone(),
        }
        .encode()
        .map_err(|e| MutationError::Encode(e.to_string()))?;

        let mut font_refs = Vec::with_capacity(plan.fonts.len());
        for (resource, standard) in &plan.fonts {
            let id = match self.font_objects.get(standard) {
                Some(id) => *id,
                None => {
                    let id = doc.add_object(dictionary! {
                        "Type" => "Font",
                        "Subtype" => "Type1",
                        "BaseFont" => *standard,
                        "Encoding" => "WinAnsiEncoding",
                    });
                    self.font_objects.insert(*standard, id);
                    id
                }
            };
            font_refs.push((resource.clone(), id));
        }

        add_fonts_to_page(doc, plan.page_id, &font_refs)?;

        let stream_id = doc.add_object(Stream::new(dictionary! {}, content));
        let page = doc
            .get_object_mut(plan.page_id)
            .and_then(|o| o.as_dict_mut())
            .map_err(|e| MutationError::Resources(e.to_string()))?;
        page.set("Contents", Object::Reference(stream_id));

        info!(
            page = plan.page_number,
            replacements = plan.replacements,
            "Applied vector edits"
        );
        Ok(plan.replacements)
    }
}

/// Register font resources on a page, materializing inherited or shared
/// resource dictionaries as needed.
fn add_fonts_to_page(
    doc: &mut Document,
    page_id: ObjectId,
    fonts: &[(String, ObjectId)],
) -> Result<(), MutationError> {
    // Resolve what the page currently uses, then decide where to write
    let inherited: Option<Dictionary> = crate::extraction::page_resources(doc, page_id).cloned();
    let page = doc
        .get_object(page_id)
        .and_then(|o| o.as_dict())
        .map_err(|e| MutationError::Resources(e.to_string()))?;
    let direct_ref = match page.get(b"Resources") {
        Ok(Object::Reference(id)) => Some(*id),
        _ => None,
    };

    let mut resources = inherited.unwrap_or_default();
    let mut font_dict = match resources.get(b"Font") {
        Ok(Object::Dictionary(d)) => d.clone(),
        Ok(Object::Reference(id)) => doc
            .get_object(*id)
            .and_then(|o| o.as_dict())
            .map(|d| d.clone())
            .unwrap_or_default(),
        _ => Dictionary::new(),
    };
    for (name, id) in fonts {
        font_dict.set(name.as_bytes().to_vec(), Object::Reference(*id));
    }
    resources.set("Font", Object::Dictionary(font_dict));

    match direct_ref {
        // Shared resource objects stay shared; extra font entries are harmless
        Some(id) => {
            let target = doc
                .get_object_mut(id)
                .map_err(|e| MutationError::Resources(e.to_string()))?;
            *target = Object::Dictionary(resources);
        }
        None => {
            let page = doc
                .get_object_mut(page_id)
                .and_then(|o| o.as_dict_mut())
                .map_err(|e| MutationError::Resources(e.to_string()))?;
            page.set("Resources", Object::Dictionary(resources));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::test_support::*;
    use lopdf::Object;
    use pretty_assertions::assert_eq;

    fn first_page(doc: &Document) -> (u32, ObjectId) {
        doc.get_pages().into_iter().next().unwrap()
    }

    fn rewrite(doc: &mut Document, pairs: &[(&str, &str)], config: &VectorConfig) -> PagePlan {
        let set = DirectiveSet::from_pairs(pairs.iter().copied(), false);
        let (n, id) = first_page(doc);
        let plan = plan_page(doc, n, id, &set, config).unwrap();
        VectorWriter::new().apply(doc, &plan).unwrap();
        plan
    }

    fn page_text(doc: &Document) -> String {
        let (n, id) = first_page(doc);
        extract_page(doc, n, id).unwrap().text()
    }

    #[test]
    fn test_replaces_and_strips_original_glyphs() {
        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, "Copyright 2025 Acme"));
        let plan = rewrite(&mut doc, &[("2025", "2026")], &VectorConfig::default());

        assert_eq!(plan.replacements, 1);
        assert_eq!(plan.contribution.count(0).vector, 1);
        let text = page_text(&doc);
        assert!(!text.contains("2025"), "old text still extractable: {}", text);
        assert!(text.contains("2026"));
        assert!(text.contains("Copyright"));
        assert!(text.contains("Acme"));
    }

    #[test]
    fn test_following_glyphs_keep_their_position() {
        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, "AB 2025 CD"));
        let (n, id) = first_page(&doc);
        let before = extract_page(&doc, n, id).unwrap();
        let cd_before = before.runs[0].chars[8].x0;

        rewrite(&mut doc, &[("2025", "2026")], &VectorConfig::default());

        let after = extract_page(&doc, n, id).unwrap();
        let original = after
            .runs
            .iter()
            .find(|r| r.text.contains("CD"))
            .unwrap();
        let c = original.chars.iter().find(|c| c.ch == 'C').unwrap();
        assert!((c.x0 - cd_before).abs() < 0.01, "{} vs {}", c.x0, cd_before);
    }

    #[test]
    fn test_inexact_metrics_cover_without_stripping() {
        let ops = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F9".into(), 12.into()]),
            Operation::new("Td", vec![72.into(), 700.into()]),
            Operation::new("Tj", vec![Object::string_literal("Draft")]),
            Operation::new("ET", vec![]),
        ];
        let mut doc = single_page(ops);
        let plan = rewrite(&mut doc, &[("draft", "Final")], &VectorConfig::default());
        assert_eq!(plan.replacements, 1);
        // Original operator kept; the cover rectangle hides it
        assert!(page_text(&doc).contains("Draft"));
        assert!(page_text(&doc).contains("Final"));
    }

    #[test]
    fn test_no_match_is_noop_plan() {
        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, "Nothing"));
        let plan = rewrite(&mut doc, &[("2025", "2026")], &VectorConfig::default());
        assert!(plan.is_noop());
        assert_eq!(plan.contribution.total(), 0);
    }

    #[test]
    fn test_overflow_note_and_shrink_policy() {
        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, "Hi there"));
        let plan = rewrite(&mut doc, &[("Hi", "Greetings")], &VectorConfig::default());
        assert!(plan
            .contribution
            .notes()
            .iter()
            .any(|n| n.kind == NoteKind::Overflow));

        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, "Hi there"));
        let config = VectorConfig {
            width_policy: WidthPolicy::ShrinkToFit,
            ..VectorConfig::default()
        };
        let plan = rewrite(&mut doc, &[("Hi", "Greetings")], &config);
        assert!(plan
            .contribution
            .notes()
            .iter()
            .any(|n| n.kind == NoteKind::Shrunk));
    }

    #[test]
    fn test_unencodable_replacement_noted() {
        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, "project"));
        let plan = rewrite(&mut doc, &[("project", "программа")], &VectorConfig::default());
        assert_eq!(plan.replacements, 1);
        assert!(plan
            .contribution
            .notes()
            .iter()
            .any(|n| n.kind == NoteKind::Unencodable));
    }

    #[test]
    fn test_font_resource_name_is_unique() {
        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, "2025"));
        rewrite(&mut doc, &[("2025", "2026")], &VectorConfig::default());
        let (n, id) = first_page(&doc);
        let page = extract_page(&doc, n, id).unwrap();
        assert!(page.font_resources.contains(&"F1".to_string()));
        assert!(page.font_resources.contains(&"RtF-Helvetica".to_string()));
    }

    #[test]
    fn test_font_resource_name_avoids_existing_entries() {
        let page = PageText {
            page_number: 1,
            page_id: (1, 0),
            media_box: Rect::new(0.0, 0.0, 612.0, 792.0),
            operations: Vec::new(),
            runs: Vec::new(),
            fills: Vec::new(),
            font_resources: vec!["F1".to_string(), "RtF-Helvetica".to_string()],
        };
        let mut fonts = BTreeMap::new();
        assert_eq!(
            font_resource_for(&page, &mut fonts, "Helvetica"),
            "RtF-Helvetica-2"
        );
        assert_eq!(font_resource_for(&page, &mut fonts, "Times-Roman"), "RtF-Times-Roman");
        assert_eq!(
            font_resource_for(&page, &mut fonts, "Helvetica"),
            "RtF-Helvetica-2"
        );
    }

    #[test]
    fn test_split_string_merges_adjacent_removals() {
        let glyphs = vec![
            (0, 1, 500.0, false),
            (1, 2, 556.0, true),
            (2, 3, 556.0, true),
            (3, 4, 278.0, false),
        ];
        let mut out = Vec::new();
        split_string(b"a12b", &StringFormat::Literal, &glyphs, &mut out);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Object::String(b, _) if b == b"a"));
        assert!(matches!(out[1], Object::Real(v) if (v + 1112.0).abs() < 1e-3));
        assert!(matches!(&out[2], Object::String(b, _) if b == b"b"));
    }
}
