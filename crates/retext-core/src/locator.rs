//! Span locator
//!
//! Finds every occurrence of each directive's `original` in the text runs of
//! a page. Text that a PDF producer split across several operators (kerning,
//! font changes, word-by-word placement) is matched through a sliding merge
//! window over consecutive runs of the same line; the window only grows as
//! far as the directive needs, so a page is never flattened into one string.
//!
//! Directives are resolved longest first. Characters claimed by one match are
//! unavailable to every later one, so overlapping directives never edit the
//! same glyph twice.

use crate::directive::{fold_char, DirectiveSet};
use crate::extraction::PageText;
use crate::geometry::Rect;
use tracing::debug;

/// Minimum horizontal gap, as a share of the font size, that reads as a space
/// between two runs.
const SPACE_GAP_RATIO: f64 = 0.15;

/// Characters `start..end` of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSlice {
    pub run: usize,
    pub start: usize,
    pub end: usize,
}

/// Where the matched text comes from
#[derive(Debug, Clone, PartialEq)]
pub enum SpanSource {
    /// Slices of the page's text runs, in reading order
    Runs(Vec<RunSlice>),
    /// Indices of OCR words, in reading order
    Words(Vec<usize>),
}

/// One accepted occurrence of a directive on one page
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSpan {
    pub page: u32,
    pub directive: usize,
    pub bbox: Rect,
    pub source: SpanSource,
}

/// Spans found on a page plus ambiguity remarks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocatedSpans {
    pub spans: Vec<MatchSpan>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct WindowChar {
    ch: char,
    /// `(run, char)` for real characters, `None` for an inserted space
    source: Option<(usize, usize)>,
}

/// Locate all directive occurrences on a structured page.
pub fn locate(page: &PageText, directives: &DirectiveSet) -> LocatedSpans {
    let lines = group_lines(page);
    let mut owner: Vec<Vec<Option<usize>>> = page
        .runs
        .iter()
        .map(|r| vec![None; r.chars.len()])
        .collect();
    let mut out = LocatedSpans::default();

    for d in directives.resolution_order() {
        let Some(directive) = directives.get(d) else {
            continue;
        };
        let case_sensitive = directive.case_sensitive();
        let needle: Vec<char> = directive
            .original()
            .chars()
            .map(|c| fold_char(c, case_sensitive))
            .collect();
        let mut shadowed_by: Vec<usize> = Vec::new();
        let mut shadowed = 0;
        let mut found = 0;

        for line in &lines {
            for occurrence in find_in_line(page, line, &needle, case_sensitive) {
                let taken: Vec<usize> = occurrence
                    .iter()
                    .filter_map(|&(r, c)| owner[r][c])
                    .collect();
                if !taken.is_empty() {
                    // Overlapping hits of the same directive are not ambiguities
                    let others: Vec<usize> = taken.into_iter().filter(|&o| o != d).collect();
                    if !others.is_empty() {
                        shadowed += 1;
                        for o in others {
                            if !shadowed_by.contains(&o) {
                                shadowed_by.push(o);
                            }
                        }
                    }
                    continue;
                }
                for &(r, c) in &occurrence {
                    owner[r][c] = Some(d);
                }
                found += 1;
                out.spans.push(to_span(page, d, &occurrence));
            }
        }

        if shadowed > 0 {
            let longer: Vec<String> = shadowed_by
                .iter()
                .filter_map(|&o| directives.get(o))
                .map(|o| format!("'{}'", o.original()))
                .collect();
            out.notes.push(format!(
                "'{}' overlapped {} on {} occurrence(s); the longer text was replaced",
                directive.original(),
                longer.join(", "),
                shadowed
            ));
        }
        debug!(
            page = page.page_number,
            directive = directive.original(),
            found,
            shadowed,
            "Located spans"
        );
    }

    out.spans.sort_by(|a, b| {
        span_start(a)
            .cmp(&span_start(b))
            .then(a.directive.cmp(&b.directive))
    });
    out
}

fn span_start(span: &MatchSpan) -> (usize, usize) {
    match &span.source {
        SpanSource::Runs(slices) => slices
            .first()
            .map(|s| (s.run, s.start))
            .unwrap_or((usize::MAX, 0)),
        SpanSource::Words(words) => (words.first().copied().unwrap_or(usize::MAX), 0),
    }
}

/// Run indices per line, left to right. Rotated runs are left out.
fn group_lines(page: &PageText) -> Vec<Vec<usize>> {
    let mut lines: Vec<Vec<usize>> = Vec::new();
    let mut current: Option<usize> = None;
    for (i, run) in page.runs.iter().enumerate() {
        if !run.axis_aligned || run.chars.is_empty() {
            continue;
        }
        if current == Some(run.line) {
            if let Some(last) = lines.last_mut() {
                last.push(i);
            }
        } else {
            lines.push(vec![i]);
            current = Some(run.line);
        }
    }
    lines
}

/// Every occurrence of `needle` on one line, left to right, each as the list
/// of `(run, char)` positions it covers. Occurrences may overlap.
fn find_in_line(
    page: &PageText,
    line: &[usize],
    needle: &[char],
    case_sensitive: bool,
) -> Vec<Vec<(usize, usize)>> {
    let mut found = Vec::new();
    if needle.is_empty() {
        return found;
    }

    for (pos, &start_run) in line.iter().enumerate() {
        let first = &page.runs[start_run];
        let first_len = first.chars.len();
        let needed = first_len + needle.len() - 1;

        let mut window: Vec<WindowChar> = first
            .chars
            .iter()
            .enumerate()
            .map(|(c, rc)| WindowChar {
                ch: fold_char(rc.ch, case_sensitive),
                source: Some((start_run, c)),
            })
            .collect();

        // Extend with following runs only while a match starting in the
        // first run could still reach into them
        let mut prev = start_run;
        for &next in &line[pos + 1..] {
            if window.len() >= needed {
                break;
            }
            if needs_virtual_space(page, prev, next) {
                window.push(WindowChar {
                    ch: ' ',
                    source: None,
                });
            }
            window.extend(page.runs[next].chars.iter().enumerate().map(|(c, rc)| {
                WindowChar {
                    ch: fold_char(rc.ch, case_sensitive),
                    source: Some((next, c)),
                }
            }));
            prev = next;
        }

        for s in 0..first_len {
            let Some(candidate) = window.get(s..s + needle.len()) else {
                break;
            };
            if candidate.iter().zip(needle).all(|(w, n)| w.ch == *n)
                && candidate.first().map_or(false, |w| w.source.is_some())
                && candidate.last().map_or(false, |w| w.source.is_some())
            {
                found.push(candidate.iter().filter_map(|w| w.source).collect());
            }
        }
    }
    found
}

fn needs_virtual_space(page: &PageText, prev: usize, next: usize) -> bool {
    let a = &page.runs[prev];
    let b = &page.runs[next];
    let ends_blank = a.chars.last().map_or(true, |c| c.ch.is_whitespace());
    let starts_blank = b.chars.first().map_or(true, |c| c.ch.is_whitespace());
    if ends_blank || starts_blank {
        return false;
    }
    b.x0() - a.x1() > SPACE_GAP_RATIO * a.font_size.max(b.font_size)
}

fn to_span(page: &PageText, directive: usize, positions: &[(usize, usize)]) -> MatchSpan {
    let mut slices: Vec<RunSlice> = Vec::new();
    for &(run, c) in positions {
        match slices.last_mut() {
            Some(last) if last.run == run && last.end == c => last.end = c + 1,
            _ => slices.push(RunSlice {
                run,
                start: c,
                end: c + 1,
            }),
        }
    }
    let bbox = slices
        .iter()
        .map(|s| page.runs[s.run].char_box(s.start, s.end))
        .reduce(|a, b| a.union(&b))
        .unwrap_or_default();
    MatchSpan {
        page: page.page_number,
        directive,
        bbox,
        source: SpanSource::Runs(slices),
    }
}
