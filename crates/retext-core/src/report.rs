//! Replacement report
//!
//! Each page produces a [`ReportContribution`]; contributions are merged in
//! whatever order pages finish. The merge sums counts per directive and keeps
//! notes sorted by page then sequence, so it is associative and commutative
//! and the final [`ReplacementReport`] does not depend on scheduling.

use crate::assemble::OutputFormat;
use crate::directive::DirectiveSet;
use crate::orchestrator::RequestState;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Category of a report note
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    /// Directive set normalization (duplicates, dropped entries)
    Directive,
    /// Translator remarks and warnings
    Translator,
    /// A shorter directive lost text to a longer overlapping one
    Ambiguity,
    /// Page had no usable text layer and went through OCR
    RasterRouted,
    /// OCR candidate skipped for low confidence
    LowConfidence,
    /// The relaxed confidence pass was used
    RelaxedPass,
    /// Replacement is noticeably wider than the original
    Overflow,
    /// Replacement was scaled down to fit
    Shrunk,
    /// Characters that the drawing font cannot encode
    Unencodable,
    /// Page failed both paths and was passed through unchanged
    PageFailed,
    /// Output format fallbacks
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// 1-based page number; `None` for request-level notes
    pub page: Option<u32>,
    pub kind: NoteKind,
    pub message: String,
    #[serde(skip)]
    seq: u32,
}

impl Note {
    pub fn request(kind: NoteKind, message: impl Into<String>) -> Self {
        Self {
            page: None,
            kind,
            message: message.into(),
            seq: 0,
        }
    }

    fn sort_key(&self) -> (Option<u32>, u32, NoteKind, &str) {
        (self.page, self.seq, self.kind, self.message.as_str())
    }
}

/// Vector and raster replacement counts for one directive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveCount {
    pub vector: usize,
    pub raster: usize,
}

impl DirectiveCount {
    pub fn total(&self) -> usize {
        self.vector + self.raster
    }
}

/// Partial report produced by one page (or merged from several)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportContribution {
    counts: BTreeMap<usize, DirectiveCount>,
    notes: Vec<Note>,
    raster_pages: BTreeSet<u32>,
    failed_pages: BTreeSet<u32>,
}

impl ReportContribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_vector(&mut self, directive: usize, n: usize) {
        if n > 0 {
            self.counts.entry(directive).or_default().vector += n;
        }
    }

    pub fn record_raster(&mut self, directive: usize, n: usize) {
        if n > 0 {
            self.counts.entry(directive).or_default().raster += n;
        }
    }

    /// Append a note for `page`; sequence numbers follow insertion order.
    pub fn note(&mut self, page: u32, kind: NoteKind, message: impl Into<String>) {
        let seq = self.notes.iter().filter(|n| n.page == Some(page)).count() as u32;
        self.notes.push(Note {
            page: Some(page),
            kind,
            message: message.into(),
            seq,
        });
        self.sort_notes();
    }

    pub fn mark_raster(&mut self, page: u32) {
        self.raster_pages.insert(page);
    }

    pub fn mark_failed(&mut self, page: u32) {
        self.failed_pages.insert(page);
    }

    pub fn count(&self, directive: usize) -> DirectiveCount {
        self.counts.get(&directive).copied().unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.counts.values().map(DirectiveCount::total).sum()
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn raster_pages(&self) -> impl Iterator<Item = u32> + '_ {
        self.raster_pages.iter().copied()
    }

    pub fn failed_pages(&self) -> impl Iterator<Item = u32> + '_ {
        self.failed_pages.iter().copied()
    }

    /// Combine two contributions. Associative and commutative.
    pub fn merge(mut self, other: ReportContribution) -> ReportContribution {
        for (directive, count) in other.counts {
            let entry = self.counts.entry(directive).or_default();
            entry.vector += count.vector;
            entry.raster += count.raster;
        }
        self.notes.extend(other.notes);
        self.sort_notes();
        self.raster_pages.extend(other.raster_pages);
        self.failed_pages.extend(other.failed_pages);
        self
    }

    fn sort_notes(&mut self) {
        self.notes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }
}

/// Per-directive line of the final report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveReport {
    pub original: String,
    pub replacement: String,
    pub case_sensitive: bool,
    pub count: usize,
    pub vector_count: usize,
    pub raster_count: usize,
}

/// Final, serializable summary of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacementReport {
    pub total_replacements: usize,
    pub directives: Vec<DirectiveReport>,
    pub page_count: usize,
    pub output_format: OutputFormat,
    pub state: RequestState,
    pub raster_pages: Vec<u32>,
    pub failed_pages: Vec<u32>,
    pub notes: Vec<Note>,
}

impl ReplacementReport {
    /// Build the report from the merged page contributions.
    ///
    /// Request-level notes (directive normalization, translator remarks)
    /// come first, followed by page notes in page order.
    pub fn build(
        directives: &DirectiveSet,
        request_notes: Vec<Note>,
        merged: ReportContribution,
        page_count: usize,
        output_format: OutputFormat,
        state: RequestState,
    ) -> Self {
        let lines: Vec<DirectiveReport> = directives
            .directives()
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let count = merged.count(i);
                DirectiveReport {
                    original: d.original().to_string(),
                    replacement: d.replacement().to_string(),
                    case_sensitive: d.case_sensitive(),
                    count: count.total(),
                    vector_count: count.vector,
                    raster_count: count.raster,
                }
            })
            .collect();

        let mut notes: Vec<Note> = directives
            .notes()
            .iter()
            .map(|n| Note::request(NoteKind::Directive, n.clone()))
            .collect();
        notes.extend(request_notes);
        let raster_pages = merged.raster_pages().collect();
        let failed_pages = merged.failed_pages().collect();
        notes.extend(merged.notes);

        Self {
            total_replacements: lines.iter().map(|l| l.count).sum(),
            directives: lines,
            page_count,
            output_format,
            state,
            raster_pages,
            failed_pages,
            notes,
        }
    }

    /// Count for the directive with the given `original`, 0 when absent.
    pub fn count_for(&self, original: &str) -> usize {
        self.directives
            .iter()
            .find(|d| d.original == original)
            .map(|d| d.count)
            .unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_merge_sums_counts() {
        let mut a = ReportContribution::new();
        a.record_vector(0, 2);
        let mut b = ReportContribution::new();
        b.record_raster(0, 1);
        b.record_vector(1, 3);

        let merged = a.merge(b);
        assert_eq!(merged.count(0), DirectiveCount { vector: 2, raster: 1 });
        assert_eq!(merged.count(1).total(), 3);
        assert_eq!(merged.count(7).total(), 0);
        assert_eq!(merged.total(), 6);
    }

    #[test]
    fn test_notes_ordered_by_page_regardless_of_merge_order() {
        let mut p2 = ReportContribution::new();
        p2.note(2, NoteKind::LowConfidence, "second page");
        let mut p1 = ReportContribution::new();
        p1.note(1, NoteKind::Ambiguity, "first page, a");
        p1.note(1, NoteKind::Overflow, "first page, b");

        let merged = p2.clone().merge(p1.clone());
        let pages: Vec<_> = merged.notes().iter().map(|n| n.message.as_str()).collect();
        assert_eq!(pages, vec!["first page, a", "first page, b", "second page"]);
        assert_eq!(merged, p1.merge(p2));
    }

    #[test]
    fn test_build_report() {
        let set = DirectiveSet::from_pairs([("2025", "2026"), ("missing", "x")], false);
        let mut c = ReportContribution::new();
        c.record_vector(0, 1);
        c.record_raster(0, 1);
        c.mark_raster(2);

        let report = ReplacementReport::build(
            &set,
            vec![],
            c,
            2,
            OutputFormat::Pdf,
            RequestState::Assembled,
        );
        assert_eq!(report.total_replacements, 2);
        assert_eq!(report.count_for("2025"), 2);
        assert_eq!(report.directives[0].vector_count, 1);
        assert_eq!(report.directives[0].raster_count, 1);
        assert_eq!(report.count_for("missing"), 0);
        assert_eq!(report.raster_pages, vec![2]);

        let json = report.to_json().unwrap();
        assert!(json.contains("\"total_replacements\": 2"));
        assert!(json.contains("\"state\": \"assembled\""));
    }
}
