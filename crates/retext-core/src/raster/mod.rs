//! Raster fallback for pages without a usable text layer
//!
//! A page is rasterized, words are recognized, directive candidates are
//! matched fuzzily against recognized phrases and the accepted ones are
//! painted over. The page comes out as a flattened image.

pub mod ocr;
pub mod paint;
pub mod render;

pub use ocr::{OcrEngine, OcrWord, PixelBox, TesseractEngine};
pub use paint::{PaintOutcome, Painter};
pub use render::{PageRasterizer, PdftoppmRasterizer};

use crate::config::{RasterConfig, WidthPolicy, OVERFLOW_NOTE_RATIO};
use crate::directive::{fold_char, Directive, DirectiveSet};
use crate::error::RecognitionError;
use crate::report::{NoteKind, ReportContribution};
use image::RgbImage;
use std::path::Path;
use tracing::{debug, info};

/// Rasterize a page and recognize its words, bounded by the configured OCR
/// timeout.
pub async fn recognize_page(
    rasterizer: &dyn PageRasterizer,
    engine: &dyn OcrEngine,
    document: &Path,
    page_number: u32,
    config: &RasterConfig,
) -> Result<(RgbImage, Vec<OcrWord>), RecognitionError> {
    let work = async {
        let image = rasterizer
            .rasterize(document, page_number, config.dpi)
            .await?;
        let words = engine.recognize(&image).await?;
        Ok::<_, RecognitionError>((image, words))
    };
    let (image, words) = tokio::time::timeout(ocr::timeout_of(config), work)
        .await
        .map_err(|_| RecognitionError::Timeout(config.ocr_timeout_ms))??;
    debug!(
        page = page_number,
        rasterizer = rasterizer.name(),
        engine = engine.name(),
        words = words.len(),
        "page recognized"
    );
    Ok((image, words))
}

/// Outcome of the raster path for one page
#[derive(Debug)]
pub struct RasterPage {
    pub page_number: u32,
    pub image: RgbImage,
    pub contribution: ReportContribution,
    pub replacements: usize,
}

impl RasterPage {
    /// Pages with zero accepted matches stay untouched in the output.
    pub fn is_modified(&self) -> bool {
        self.replacements > 0
    }
}

/// An accepted candidate: consecutive words standing for one directive
#[derive(Debug, Clone, PartialEq)]
struct Accepted {
    directive: usize,
    words: Vec<usize>,
    text: String,
    occurrences: usize,
}

/// Similar enough but below the confidence floor
#[derive(Debug, Clone, PartialEq)]
struct Skipped {
    directive: usize,
    seen: String,
    confidence: f64,
}

#[derive(Debug, Default)]
struct Selection {
    accepted: Vec<Accepted>,
    skipped: Vec<Skipped>,
}

/// Match directives against recognized words and paint accepted matches
/// onto `image`.
pub fn mutate_page(
    page_number: u32,
    mut image: RgbImage,
    words: &[OcrWord],
    directives: &DirectiveSet,
    config: &RasterConfig,
    painter: &Painter,
) -> RasterPage {
    let mut contribution = ReportContribution::new();
    contribution.mark_raster(page_number);

    let words: Vec<&OcrWord> = words.iter().filter(|w| !w.text.trim().is_empty()).collect();
    let segments = phrase_segments(&words, config.line_gap_factor);

    let mut selection = select(
        &words,
        &segments,
        directives,
        config.similarity_threshold,
        config.confidence_floor,
    );

    if selection.accepted.is_empty() && !selection.skipped.is_empty() {
        if let Some(relaxed) = config.relaxed_confidence_floor {
            if relaxed < config.confidence_floor {
                contribution.note(
                    page_number,
                    NoteKind::RelaxedPass,
                    format!(
                        "No confident match; retried with confidence floor {} (was {})",
                        relaxed, config.confidence_floor
                    ),
                );
                selection = select(
                    &words,
                    &segments,
                    directives,
                    config.similarity_threshold,
                    relaxed,
                );
            }
        }
    }

    for skipped in &selection.skipped {
        if let Some(d) = directives.get(skipped.directive) {
            contribution.note(
                page_number,
                NoteKind::LowConfidence,
                format!(
                    "'{}' resembled '{}' but was skipped (low confidence {:.0})",
                    skipped.seen,
                    d.original(),
                    skipped.confidence
                ),
            );
        }
    }

    let mut replacements = 0;
    for accepted in &selection.accepted {
        let Some(area) = accepted
            .words
            .iter()
            .map(|&i| words[i].bbox)
            .reduce(|a, b| a.union(&b))
        else {
            continue;
        };
        let outcome = painter.paint(&mut image, area, &accepted.text, config.width_policy);
        note_width(&mut contribution, page_number, &accepted.text, outcome, config.width_policy);
        contribution.record_raster(accepted.directive, accepted.occurrences);
        replacements += accepted.occurrences;
        debug!(
            page = page_number,
            directive = accepted.directive,
            text = %accepted.text,
            px = outcome.font_px,
            "painted replacement"
        );
    }

    info!(page = page_number, replacements, "raster pass finished");
    RasterPage {
        page_number,
        image,
        contribution,
        replacements,
    }
}

fn note_width(
    contribution: &mut ReportContribution,
    page: u32,
    text: &str,
    outcome: PaintOutcome,
    policy: WidthPolicy,
) {
    if outcome.shrunk {
        contribution.note(
            page,
            NoteKind::Shrunk,
            format!("'{}' was drawn at {:.0}px to fit the original width", text, outcome.font_px),
        );
    } else if policy == WidthPolicy::KeepSize && outcome.width_ratio > OVERFLOW_NOTE_RATIO {
        contribution.note(
            page,
            NoteKind::Overflow,
            format!(
                "'{}' is {:.0}% wider than the text it replaced",
                text,
                (outcome.width_ratio - 1.0) * 100.0
            ),
        );
    }
}

/// Split words into lines by vertical overlap, then lines into phrases at
/// wide horizontal gaps. Each segment lists word indices left to right.
fn phrase_segments(words: &[&OcrWord], gap_factor: f64) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..words.len()).collect();
    order.sort_by(|&a, &b| {
        words[a]
            .bbox
            .top
            .cmp(&words[b].bbox.top)
            .then(words[a].bbox.left.cmp(&words[b].bbox.left))
    });

    let mut lines: Vec<Vec<usize>> = Vec::new();
    for i in order {
        let word = &words[i].bbox;
        let line = lines.iter_mut().find(|line| {
            let first = &words[line[0]].bbox;
            let band = first.height.max(word.height) as f64 / 2.0;
            (first.center_y() - word.center_y()).abs() <= band
        });
        match line {
            Some(line) => line.push(i),
            None => lines.push(vec![i]),
        }
    }

    let mut segments = Vec::new();
    for mut line in lines {
        line.sort_by_key(|&i| words[i].bbox.left);
        let mut current: Vec<usize> = Vec::new();
        for i in line {
            if let Some(&prev) = current.last() {
                let a = &words[prev].bbox;
                let b = &words[i].bbox;
                let gap = b.left as f64 - a.right() as f64;
                if gap > gap_factor * a.height.max(b.height) as f64 {
                    segments.push(std::mem::take(&mut current));
                }
            }
            current.push(i);
        }
        if !current.is_empty() {
            segments.push(current);
        }
    }
    segments
}

fn select(
    words: &[&OcrWord],
    segments: &[Vec<usize>],
    directives: &DirectiveSet,
    threshold: f64,
    floor: f64,
) -> Selection {
    let mut used = vec![false; words.len()];
    let mut selection = Selection::default();

    for index in directives.resolution_order() {
        let Some(directive) = directives.get(index) else {
            continue;
        };
        let span = directive.original().split_whitespace().count().max(1);

        for segment in segments {
            let mut start = 0;
            while start + span <= segment.len() {
                let window = &segment[start..start + span];
                if window.iter().any(|&w| used[w]) {
                    start += 1;
                    continue;
                }
                let seen = window
                    .iter()
                    .map(|&w| words[w].text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let candidate = score(&seen, directive);
                if candidate.similarity >= threshold {
                    let confidence = window
                        .iter()
                        .map(|&w| words[w].confidence)
                        .fold(f64::INFINITY, f64::min);
                    if confidence >= floor {
                        for &w in window {
                            used[w] = true;
                        }
                        selection.accepted.push(Accepted {
                            directive: index,
                            words: window.to_vec(),
                            text: candidate.text,
                            occurrences: candidate.occurrences,
                        });
                        start += span;
                        continue;
                    }
                    selection.skipped.push(Skipped {
                        directive: index,
                        seen,
                        confidence,
                    });
                }
                start += 1;
            }
        }
    }
    selection
}

struct Candidate {
    similarity: f64,
    /// Text to paint over the window
    text: String,
    occurrences: usize,
}

/// Compare recognized text with a directive's original. Containment is a
/// full match and substitutes inside the word, keeping surrounding
/// characters (e.g. punctuation) as recognized.
fn score(seen: &str, directive: &Directive) -> Candidate {
    let case_sensitive = directive.case_sensitive();
    let chars: Vec<char> = seen.chars().collect();
    let folded: Vec<char> = chars.iter().map(|&c| fold_char(c, case_sensitive)).collect();
    let needle: Vec<char> = directive
        .original()
        .chars()
        .map(|c| fold_char(c, case_sensitive))
        .collect();

    if folded == needle {
        return Candidate {
            similarity: 1.0,
            text: directive.replacement().to_string(),
            occurrences: 1,
        };
    }

    let mut text = String::new();
    let mut occurrences = 0;
    let mut i = 0;
    while i < chars.len() {
        if !needle.is_empty() && folded[i..].starts_with(&needle) {
            text.push_str(directive.replacement());
            occurrences += 1;
            i += needle.len();
        } else {
            text.push(chars[i]);
            i += 1;
        }
    }
    if occurrences > 0 {
        return Candidate {
            similarity: 1.0,
            text,
            occurrences,
        };
    }

    // Punctuation stuck to the recognized word is kept around the replacement
    let (start, end) = word_core(&chars, &needle);
    let a: String = folded[start..end].iter().collect();
    let b: String = needle.iter().collect();
    let mut text: String = chars[..start].iter().collect();
    text.push_str(directive.replacement());
    text.extend(&chars[end..]);
    Candidate {
        similarity: strsim::normalized_levenshtein(&a, &b),
        text,
        occurrences: 1,
    }
}

/// Bounds of `chars` without leading and trailing non-alphanumerics, unless
/// the needle itself starts or ends with one.
fn word_core(chars: &[char], needle: &[char]) -> (usize, usize) {
    let mut start = 0;
    let mut end = chars.len();
    if needle.first().is_some_and(|c| c.is_alphanumeric()) {
        while start < end && !chars[start].is_alphanumeric() {
            start += 1;
        }
    }
    if needle.last().is_some_and(|c| c.is_alphanumeric()) {
        while end > start && !chars[end - 1].is_alphanumeric() {
            end -= 1;
        }
    }
    (start, end)
}
