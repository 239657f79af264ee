//! End-to-end requests through the replacement engine

mod common;

use common::*;
use lopdf::Document;
use pretty_assertions::assert_eq;
use retext_core::config::{MultiPageImagePolicy, TranslatorConfig};
use retext_core::extraction::extract_page;
use retext_core::report::NoteKind;
use retext_core::{
    Artifact, EditError, EditRequest, EngineConfig, Instructions, OutputFormat, ParseError,
    RequestState, Translator,
};
use std::sync::Arc;
use std::time::Duration;

fn manual(pairs: &[(&str, &str)], case_sensitive: bool) -> Instructions {
    Instructions::Manual {
        replacements: pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect(),
        case_sensitive,
    }
}

fn document_bytes(artifact: &Artifact) -> &[u8] {
    match artifact {
        Artifact::Document(bytes) => bytes,
        Artifact::Images(_) => panic!("expected a document"),
    }
}

fn page_text(bytes: &[u8], page_number: u32) -> String {
    let doc = Document::load_mem(bytes).unwrap();
    let page_id = doc.get_pages()[&page_number];
    extract_page(&doc, page_number, page_id).unwrap().text()
}

#[tokio::test]
async fn test_text_page_and_scanned_page() {
    let ocr = Arc::new(ScriptedOcr::new(invoice_words()));
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025"), PageSpec::Scanned]);
    let request = EditRequest::new(pdf, manual(&[("2025", "2026")], false));

    let outcome = engine(ocr.clone()).run(request).await.unwrap();
    let report = &outcome.report;

    assert_eq!(report.state, RequestState::Assembled);
    assert_eq!(report.total_replacements, 2);
    assert_eq!(report.directives[0].vector_count, 1);
    assert_eq!(report.directives[0].raster_count, 1);
    assert_eq!(report.raster_pages, vec![2]);
    assert!(report.failed_pages.is_empty());
    assert_eq!(ocr.calls(), 1);
    assert!(report
        .notes
        .iter()
        .any(|n| n.page == Some(2) && n.kind == NoteKind::RasterRouted));

    let bytes = document_bytes(&outcome.artifact);
    let text = page_text(bytes, 1);
    assert!(text.contains("2026"), "page 1: {}", text);
    assert!(!text.contains("2025"), "page 1: {}", text);

    // the scanned page is now a single image
    let doc = Document::load_mem(bytes).unwrap();
    let page = doc.get_dictionary(doc.get_pages()[&2]).unwrap();
    let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
    assert!(resources.get(b"XObject").is_ok());
}

#[tokio::test]
async fn test_per_directive_total_is_vector_plus_raster() {
    let ocr = Arc::new(ScriptedOcr::new(invoice_words()));
    let pdf = build_pdf(&[
        PageSpec::Text("Invoice 2025 of 2025"),
        PageSpec::Scanned,
        PageSpec::Text("nothing here"),
    ]);
    let request = EditRequest::new(pdf, manual(&[("2025", "2026"), ("Invoice", "Bill")], false));
    let report = engine(ocr).run(request).await.unwrap().report;

    for line in &report.directives {
        assert_eq!(line.count, line.vector_count + line.raster_count);
    }
    assert_eq!(report.count_for("2025"), 3);
    assert_eq!(report.count_for("Invoice"), 2);
    assert_eq!(report.total_replacements, 5);
}

#[tokio::test]
async fn test_longer_directive_wins_overlap() {
    let pdf = build_pdf(&[PageSpec::Text("Fiscal year 2025")]);
    let request = EditRequest::new(pdf, manual(&[("2025", "X"), ("025", "Y")], false));
    let report = engine(Arc::new(FailingOcr)).run(request).await.unwrap().report;

    assert_eq!(report.count_for("2025"), 1);
    assert_eq!(report.count_for("025"), 0);
    assert!(report.notes.iter().any(|n| n.kind == NoteKind::Ambiguity));
}

#[tokio::test]
async fn test_case_insensitive_matching() {
    let pdf = build_pdf(&[PageSpec::Text("Draft draft DRAFT")]);
    let request = EditRequest::new(pdf.clone(), manual(&[("Draft", "Final")], false));
    let report = engine(Arc::new(FailingOcr)).run(request).await.unwrap().report;
    assert_eq!(report.count_for("Draft"), 3);

    let request = EditRequest::new(pdf, manual(&[("Draft", "Final")], true));
    let report = engine(Arc::new(FailingOcr)).run(request).await.unwrap().report;
    assert_eq!(report.count_for("Draft"), 1);
}

#[tokio::test]
async fn test_absent_text_reports_zero() {
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025")]);
    let request = EditRequest::new(pdf, manual(&[("Purchase order", "PO")], false));
    let outcome = engine(Arc::new(FailingOcr)).run(request).await.unwrap();
    assert_eq!(outcome.report.count_for("Purchase order"), 0);
    assert_eq!(outcome.report.total_replacements, 0);
    assert_eq!(outcome.report.state, RequestState::Assembled);
}

#[tokio::test]
async fn test_empty_directives_return_identical_document() {
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025"), PageSpec::Scanned]);
    let ocr = Arc::new(ScriptedOcr::new(invoice_words()));
    let request = EditRequest::new(pdf.clone(), manual(&[], false));
    let outcome = engine(ocr.clone()).run(request).await.unwrap();

    assert_eq!(outcome.artifact, Artifact::Document(pdf));
    assert_eq!(outcome.report.total_replacements, 0);
    assert_eq!(ocr.calls(), 0);
}

#[tokio::test]
async fn test_output_is_deterministic() {
    let pdf = build_pdf(&[
        PageSpec::Text("Invoice 2025"),
        PageSpec::Scanned,
        PageSpec::Text("Due 2025-01-31"),
        PageSpec::Text("Total 2025"),
    ]);
    let mut outputs = Vec::new();
    for _ in 0..3 {
        let ocr = Arc::new(ScriptedOcr::new(invoice_words()));
        let request = EditRequest::new(pdf.clone(), manual(&[("2025", "2026")], false));
        let outcome = engine(ocr).run(request).await.unwrap();
        outputs.push((outcome.artifact, outcome.report.to_json().unwrap()));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[tokio::test]
async fn test_text_pages_never_reach_ocr() {
    let ocr = Arc::new(ScriptedOcr::new(invoice_words()));
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025"), PageSpec::Text("No year")]);
    let request = EditRequest::new(pdf, manual(&[("2025", "2026")], false));
    let report = engine(ocr.clone()).run(request).await.unwrap().report;

    assert_eq!(ocr.calls(), 0);
    assert!(report.raster_pages.is_empty());
    assert_eq!(report.count_for("2025"), 1);
}

#[tokio::test]
async fn test_ocr_failure_passes_page_through() {
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025"), PageSpec::Scanned]);
    let request = EditRequest::new(pdf, manual(&[("2025", "2026")], false));
    let outcome = engine(Arc::new(FailingOcr)).run(request).await.unwrap();
    let report = &outcome.report;

    assert_eq!(report.state, RequestState::PartiallyAssembled);
    assert_eq!(report.failed_pages, vec![2]);
    assert_eq!(report.count_for("2025"), 1);
    assert!(report
        .notes
        .iter()
        .any(|n| n.page == Some(2) && n.kind == NoteKind::PageFailed));

    // the failed page keeps its original content
    let doc = Document::load_mem(document_bytes(&outcome.artifact)).unwrap();
    let page = doc.get_dictionary(doc.get_pages()[&2]).unwrap();
    assert!(page.get(b"Contents").is_ok());
    assert_eq!(doc.get_pages().len(), 2);
}

#[tokio::test]
async fn test_all_pages_failing_fails_request() {
    let pdf = build_pdf(&[PageSpec::Scanned]);
    let request = EditRequest::new(pdf, manual(&[("2025", "2026")], false));
    let err = engine(Arc::new(FailingOcr)).run(request).await.unwrap_err();
    assert!(matches!(err, EditError::AllPagesFailed(_)));
}

#[tokio::test]
async fn test_unopenable_document() {
    let request = EditRequest::new(b"%PDF-1.4\ngarbage".to_vec(), manual(&[("a", "b")], false));
    let err = engine(Arc::new(FailingOcr)).run(request).await.unwrap_err();
    assert!(matches!(err, EditError::InputError(_)));
}

#[tokio::test]
async fn test_prompt_is_translated_into_directives() {
    let translator = Translator::new(
        Arc::new(FixedCompletion {
            content: r#"{"directives":[{"original":"2025","replacement":"2026","case_sensitive":false}],"notes":""}"#
                .to_string(),
        }),
        TranslatorConfig::default(),
    );
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025")]);
    let request = EditRequest::new(
        pdf,
        Instructions::Prompt("Replace all occurrences of 2025 with 2026".to_string()),
    );
    let report = engine(Arc::new(FailingOcr))
        .with_translator(translator)
        .run(request)
        .await
        .unwrap()
        .report;

    assert_eq!(report.directives.len(), 1);
    assert_eq!(report.directives[0].original, "2025");
    assert_eq!(report.directives[0].replacement, "2026");
    assert_eq!(report.count_for("2025"), 1);
}

#[tokio::test]
async fn test_unreachable_translator_is_parse_error() {
    let config = TranslatorConfig {
        // nothing listens on the discard port
        base_url: "http://127.0.0.1:9/v1".to_string(),
        api_key: Some("test-key".to_string()),
        timeout_ms: 2_000,
        retry_backoff_ms: 1,
        ..TranslatorConfig::default()
    };
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025")]);
    let request = EditRequest::new(
        pdf,
        Instructions::Prompt("Replace all occurrences of 2025 with 2026".to_string()),
    );
    let err = engine(Arc::new(FailingOcr))
        .with_translator(Translator::from_config(config))
        .run(request)
        .await
        .unwrap_err();

    assert!(matches!(err, EditError::ParseError(ParseError::Unavailable(_))));
    assert_eq!(err.failure_kind(), retext_core::FailureKind::Instructions);
}

#[tokio::test]
async fn test_image_output_every_page() {
    let ocr = Arc::new(ScriptedOcr::new(invoice_words()));
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025"), PageSpec::Scanned]);
    let request =
        EditRequest::new(pdf, manual(&[("2025", "2026")], false)).with_format(OutputFormat::Png);
    let outcome = engine(ocr).run(request).await.unwrap();

    assert_eq!(outcome.report.output_format, OutputFormat::Png);
    match outcome.artifact {
        Artifact::Images(images) => {
            assert_eq!(images.len(), 2);
            assert_eq!(images[0].page_number, 1);
            assert_eq!(images[1].page_number, 2);
            assert!(images.iter().all(|i| &i.bytes[1..4] == b"PNG"));
        }
        Artifact::Document(_) => panic!("expected images"),
    }
}

#[tokio::test]
async fn test_image_output_document_policy_falls_back() {
    let mut config = EngineConfig::default();
    config.output.multi_page_images = MultiPageImagePolicy::Document;
    let pdf = build_pdf(&[PageSpec::Text("Invoice 2025"), PageSpec::Text("Page two")]);
    let request =
        EditRequest::new(pdf, manual(&[("2025", "2026")], false)).with_format(OutputFormat::Jpeg);
    let outcome = engine_with(config, Arc::new(FailingOcr))
        .run(request)
        .await
        .unwrap();

    assert!(matches!(outcome.artifact, Artifact::Document(_)));
    assert_eq!(outcome.report.output_format, OutputFormat::Pdf);
    assert!(outcome
        .report
        .notes
        .iter()
        .any(|n| n.kind == NoteKind::Output));
}

#[tokio::test]
async fn test_request_timeout_cancels() {
    let config = EngineConfig {
        request_timeout_ms: 50,
        ..EngineConfig::default()
    };
    let ocr = Arc::new(ScriptedOcr::slow(Duration::from_secs(30)));
    let pdf = build_pdf(&[PageSpec::Scanned]);
    let request = EditRequest::new(pdf, manual(&[("2025", "2026")], false));
    let err = engine_with(config, ocr).run(request).await.unwrap_err();
    assert!(matches!(err, EditError::Cancelled(_)));
}

/// Base font of the run showing `needle` on a page of the output
fn base_font_of(bytes: &[u8], page_number: u32, needle: &str) -> String {
    let doc = Document::load_mem(bytes).unwrap();
    let page_id = doc.get_pages()[&page_number];
    let page = extract_page(&doc, page_number, page_id).unwrap();
    page.runs
        .iter()
        .find(|r| r.text.contains(needle))
        .map(|r| r.base_font.clone())
        .unwrap_or_else(|| panic!("no run with '{}' on page {}", needle, page_number))
}

#[tokio::test]
async fn test_pages_sharing_resources_keep_their_own_font() {
    let ocr = Arc::new(ScriptedOcr::new(Vec::new()));
    let pdf = build_pdf(&[
        PageSpec::Styled { text: "Year 2025", font: "F1" },
        PageSpec::Styled { text: "Year 2025", font: "F2" },
        PageSpec::Styled { text: "Year 2025", font: "F3" },
    ]);
    let request = EditRequest::new(pdf, manual(&[("2025", "2026")], false));

    let outcome = engine(ocr.clone()).run(request).await.unwrap();
    assert_eq!(outcome.report.total_replacements, 3);
    assert_eq!(ocr.calls(), 0);

    let bytes = document_bytes(&outcome.artifact);
    assert_eq!(base_font_of(bytes, 1, "2026"), "Helvetica");
    assert_eq!(base_font_of(bytes, 2, "2026"), "Times-Roman");
    assert_eq!(base_font_of(bytes, 3, "2026"), "Courier");
    // untouched text still resolves through the original entries
    assert_eq!(base_font_of(bytes, 2, "Year"), "Times-Roman");
}

#[tokio::test]
async fn test_inherited_resources_are_extended_per_page() {
    let ocr = Arc::new(ScriptedOcr::new(Vec::new()));
    let pdf = build_pdf_with(
        &[
            PageSpec::Styled { text: "Total 2025", font: "F2" },
            PageSpec::Styled { text: "Nothing to change", font: "F1" },
            PageSpec::Styled { text: "Total 2025", font: "F1" },
        ],
        ResourceLayout::Inherited,
    );
    let request = EditRequest::new(pdf, manual(&[("2025", "2026")], false));

    let outcome = engine(ocr).run(request).await.unwrap();
    assert_eq!(outcome.report.state, RequestState::Assembled);
    assert_eq!(outcome.report.total_replacements, 2);

    let bytes = document_bytes(&outcome.artifact);
    assert_eq!(base_font_of(bytes, 1, "2026"), "Times-Roman");
    assert_eq!(base_font_of(bytes, 3, "2026"), "Helvetica");
    assert_eq!(base_font_of(bytes, 2, "Nothing"), "Helvetica");
    assert!(!page_text(bytes, 1).contains("2025"));
}
