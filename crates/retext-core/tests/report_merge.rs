//! Merging page contributions must not depend on completion order

use proptest::prelude::*;
use retext_core::directive::DirectiveSet;
use retext_core::report::{NoteKind, ReplacementReport, ReportContribution};
use retext_core::{OutputFormat, RequestState};

#[derive(Debug, Clone)]
enum Event {
    Vector(usize, usize),
    Raster(usize, usize),
    Note(u32, u8),
    Failed(u32),
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        (0..4usize, 0..5usize).prop_map(|(d, n)| Event::Vector(d, n)),
        (0..4usize, 0..5usize).prop_map(|(d, n)| Event::Raster(d, n)),
        (1..6u32, 0..3u8).prop_map(|(p, m)| Event::Note(p, m)),
        (1..6u32).prop_map(Event::Failed),
    ]
}

/// A contribution as produced by one page
fn page_contribution() -> impl Strategy<Value = ReportContribution> {
    (1..6u32, proptest::collection::vec(event(), 0..6)).prop_map(|(page, events)| {
        let mut c = ReportContribution::new();
        for e in events {
            match e {
                Event::Vector(d, n) => c.record_vector(d, n),
                Event::Raster(d, n) => {
                    c.record_raster(d, n);
                    c.mark_raster(page);
                }
                Event::Note(_, m) => c.note(page, NoteKind::Overflow, format!("note {}", m)),
                Event::Failed(_) => c.mark_failed(page),
            }
        }
        c
    })
}

proptest! {
    #[test]
    fn merge_is_commutative(a in page_contribution(), b in page_contribution()) {
        prop_assert_eq!(a.clone().merge(b.clone()), b.merge(a));
    }

    #[test]
    fn merge_is_associative(
        a in page_contribution(),
        b in page_contribution(),
        c in page_contribution(),
    ) {
        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.merge(b.merge(c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn report_total_is_sum_of_directive_counts(
        parts in proptest::collection::vec(page_contribution(), 1..5)
    ) {
        let directives = DirectiveSet::from_pairs(
            [("a", "1"), ("bb", "2"), ("ccc", "3"), ("dddd", "4")],
            false,
        );
        let merged = parts
            .into_iter()
            .fold(ReportContribution::new(), ReportContribution::merge);
        let expected = merged.total();
        let report = ReplacementReport::build(
            &directives,
            Vec::new(),
            merged,
            5,
            OutputFormat::Pdf,
            RequestState::Assembled,
        );
        prop_assert_eq!(report.total_replacements, expected);
        for line in &report.directives {
            prop_assert_eq!(line.count, line.vector_count + line.raster_count);
        }
    }
}
