//! Replacement orchestrator
//!
//! Drives a request through
//! `Received -> VectorPass -> RasterPass -> Merged -> {Assembled | PartiallyAssembled | Failed}`.
//! Pages are processed in parallel on a bounded pool; per-page reports are
//! merged independently of completion order and edits are written back by a
//! single owner in page order, so output is deterministic.

use crate::assemble::{
    image_pages, render_images, replace_with_image, save_document, Artifact, OutputFormat,
};
use crate::config::EngineConfig;
use crate::directive::DirectiveSet;
use crate::error::{EditError, ExtractionError, ParseError, RecognitionError};
use crate::raster::{
    mutate_page, recognize_page, OcrEngine, PageRasterizer, Painter, PdftoppmRasterizer,
    RasterPage, TesseractEngine,
};
use crate::report::{Note, NoteKind, ReplacementReport, ReportContribution};
use crate::translator::Translator;
use crate::vector::{plan_page, PagePlan, VectorWriter};
use image::RgbImage;
use lopdf::{Document, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Lifecycle of an edit request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    VectorPass,
    RasterPass,
    Merged,
    Assembled,
    PartiallyAssembled,
    Failed,
}

/// How the caller expresses the edits
#[derive(Debug, Clone, PartialEq)]
pub enum Instructions {
    /// Explicit original to replacement pairs sharing one case flag
    Manual {
        replacements: Vec<(String, String)>,
        case_sensitive: bool,
    },
    /// An already validated directive set
    Directives(DirectiveSet),
    /// Free text, translated into directives first
    Prompt(String),
}

#[derive(Debug, Clone)]
pub struct EditRequest {
    pub document: Vec<u8>,
    pub instructions: Instructions,
    pub output_format: OutputFormat,
}

impl EditRequest {
    pub fn new(document: Vec<u8>, instructions: Instructions) -> Self {
        Self {
            document,
            instructions,
            output_format: OutputFormat::default(),
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }
}

#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub artifact: Artifact,
    pub report: ReplacementReport,
}

/// Vector pass result for one page
enum VectorOutcome {
    Planned(PagePlan),
    Unusable(ExtractionError),
}

/// Runs edit requests. Collaborators sit behind `Arc` so page tasks can share them.
pub struct ReplacementEngine {
    config: Arc<EngineConfig>,
    translator: Arc<Translator>,
    rasterizer: Result<Arc<dyn PageRasterizer>, RecognitionError>,
    ocr: Result<Arc<dyn OcrEngine>, RecognitionError>,
    painter: Arc<Painter>,
}

impl ReplacementEngine {
    /// Engine wired to the HTTP translator, `pdftoppm` and `tesseract`.
    /// Missing tools only fail the pages that need them.
    pub fn from_config(config: EngineConfig) -> Self {
        let rasterizer = PdftoppmRasterizer::from_config(&config.raster)
            .map(|r| Arc::new(r) as Arc<dyn PageRasterizer>);
        let ocr = TesseractEngine::from_config(&config.raster)
            .map(|e| Arc::new(e) as Arc<dyn OcrEngine>);
        if let Err(e) = &rasterizer {
            warn!(error = %e, "rasterizer unavailable");
        }
        if let Err(e) = &ocr {
            warn!(error = %e, "OCR engine unavailable");
        }
        Self {
            translator: Arc::new(Translator::from_config(config.translator.clone())),
            painter: Arc::new(Painter::load(&config.raster)),
            config: Arc::new(config),
            rasterizer,
            ocr,
        }
    }

    pub fn with_translator(mut self, translator: Translator) -> Self {
        self.translator = Arc::new(translator);
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = Ok(rasterizer);
        self
    }

    pub fn with_ocr_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Ok(engine);
        self
    }

    pub fn with_painter(mut self, painter: Painter) -> Self {
        self.painter = Arc::new(painter);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a request within the configured request timeout. Dropping the
    /// returned future cancels all in-flight page work.
    pub async fn run(&self, request: EditRequest) -> Result<EditOutcome, EditError> {
        let timeout_ms = self.config.request_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.process(request)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms, state = ?RequestState::Failed, "request timed out");
                Err(EditError::Cancelled(format!(
                    "request exceeded {}ms",
                    timeout_ms
                )))
            }
        }
    }

    async fn process(&self, request: EditRequest) -> Result<EditOutcome, EditError> {
        let mut state = RequestState::Received;
        info!(
            state = ?state,
            bytes = request.document.len(),
            format = %request.output_format,
            "edit request received"
        );

        let doc = match Document::load_mem(&request.document) {
            Ok(doc) => doc,
            Err(e) => {
                fail(&mut state);
                return Err(EditError::InputError(e.to_string()));
            }
        };
        let pages: BTreeMap<u32, ObjectId> = doc.get_pages();
        if pages.is_empty() {
            fail(&mut state);
            return Err(EditError::InputError("document has no pages".to_string()));
        }
        let page_count = pages.len();

        let (directives, request_notes) = match self.resolve_directives(request.instructions).await {
            Ok(resolved) => resolved,
            Err(e) => {
                fail(&mut state);
                return Err(e.into());
            }
        };
        let directives = Arc::new(directives);
        info!(directives = directives.len(), pages = page_count, "directives resolved");

        let format = request.output_format;
        if directives.is_empty() && format == OutputFormat::Pdf {
            advance(&mut state, RequestState::Assembled);
            let report = ReplacementReport::build(
                &directives,
                request_notes,
                ReportContribution::new(),
                page_count,
                format,
                state,
            );
            return Ok(EditOutcome {
                artifact: Artifact::Document(request.document),
                report,
            });
        }

        let mut merged = ReportContribution::new();
        let mut painted: BTreeMap<u32, RgbImage> = BTreeMap::new();
        let mut doc = doc;

        if !directives.is_empty() {
            advance(&mut state, RequestState::VectorPass);
            let shared = Arc::new(doc);
            let outcomes = self.vector_pass(&shared, &pages, &directives).await;
            doc = Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone());

            let mut writer = VectorWriter::new();
            let mut routed = Vec::new();
            for (&page_number, page_id) in &pages {
                match outcomes.get(&page_number) {
                    Some(VectorOutcome::Planned(plan)) => match writer.apply(&mut doc, plan) {
                        Ok(_) => merged = merged.merge(plan.contribution.clone()),
                        Err(e) => {
                            warn!(page = page_number, error = %e, "vector edits not written");
                            merged = merged.merge(page_failure(
                                page_number,
                                format!("Edits could not be written, page left unchanged: {}", e),
                            ));
                        }
                    },
                    Some(VectorOutcome::Unusable(reason)) => {
                        debug!(page = page_number, reason = %reason, "routing page to OCR");
                        let mut routed_note = ReportContribution::new();
                        routed_note.note(
                            page_number,
                            NoteKind::RasterRouted,
                            format!("No usable text layer ({}); processed with OCR", reason),
                        );
                        merged = merged.merge(routed_note);
                        routed.push((page_number, *page_id));
                    }
                    None => {
                        merged = merged.merge(page_failure(
                            page_number,
                            "Page analysis aborted, page left unchanged".to_string(),
                        ));
                    }
                }
            }

            if !routed.is_empty() {
                advance(&mut state, RequestState::RasterPass);
                let results = self
                    .raster_pass(&request.document, &routed, &directives)
                    .await;
                for (page_number, page_id) in routed {
                    match results.get(&page_number) {
                        Some(Ok(page)) => {
                            if page.is_modified() {
                                if let Err(e) = replace_with_image(&mut doc, page_id, &page.image) {
                                    warn!(page = page_number, error = %e, "raster page not written");
                                    merged = merged.merge(page_failure(
                                        page_number,
                                        format!("OCR edits could not be written: {}", e),
                                    ));
                                    continue;
                                }
                                painted.insert(page_number, page.image.clone());
                            }
                            merged = merged.merge(page.contribution.clone());
                        }
                        Some(Err(e)) => {
                            warn!(page = page_number, error = %e, "OCR failed, page left unchanged");
                            merged = merged.merge(page_failure(
                                page_number,
                                format!("Text layer unusable and OCR failed: {}", e),
                            ));
                        }
                        None => {
                            merged = merged.merge(page_failure(
                                page_number,
                                "OCR aborted, page left unchanged".to_string(),
                            ));
                        }
                    }
                }
            }
        }

        advance(&mut state, RequestState::Merged);
        let failed = merged.failed_pages().count();
        if failed == page_count {
            fail(&mut state);
            return Err(EditError::AllPagesFailed(format!(
                "all {} page(s) failed",
                page_count
            )));
        }

        let mut request_notes = request_notes;
        let (artifact, produced) = match self.assemble(&mut doc, page_count, format, &painted).await {
            Ok(assembled) => assembled,
            Err(e) => {
                fail(&mut state);
                return Err(e);
            }
        };
        if produced != format {
            request_notes.push(Note::request(
                NoteKind::Output,
                format!(
                    "Multi-page document returned as {} instead of {}",
                    produced, format
                ),
            ));
        }

        let next = if failed > 0 {
            RequestState::PartiallyAssembled
        } else {
            RequestState::Assembled
        };
        advance(&mut state, next);

        let report = ReplacementReport::build(
            &directives,
            request_notes,
            merged,
            page_count,
            produced,
            state,
        );
        info!(
            total = report.total_replacements,
            raster_pages = report.raster_pages.len(),
            failed_pages = report.failed_pages.len(),
            state = ?state,
            "edit request finished"
        );
        Ok(EditOutcome { artifact, report })
    }

    async fn resolve_directives(
        &self,
        instructions: Instructions,
    ) -> Result<(DirectiveSet, Vec<Note>), ParseError> {
        match instructions {
            Instructions::Manual {
                replacements,
                case_sensitive,
            } => Ok((DirectiveSet::from_pairs(replacements, case_sensitive), Vec::new())),
            Instructions::Directives(set) => Ok((set, Vec::new())),
            Instructions::Prompt(prompt) => {
                let parsed = self.translator.translate(&prompt).await?;
                let mut notes: Vec<Note> = parsed
                    .notes
                    .into_iter()
                    .map(|n| Note::request(NoteKind::Translator, n))
                    .collect();
                if parsed.partial {
                    notes.push(Note::request(
                        NoteKind::Translator,
                        "Some instructions could not be used; review the directives",
                    ));
                }
                Ok((parsed.directives, notes))
            }
        }
    }

    async fn vector_pass(
        &self,
        doc: &Arc<Document>,
        pages: &BTreeMap<u32, ObjectId>,
        directives: &Arc<DirectiveSet>,
    ) -> BTreeMap<u32, VectorOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_pages));
        let mut tasks = JoinSet::new();

        for (&page_number, &page_id) in pages {
            let doc = Arc::clone(doc);
            let directives = Arc::clone(directives);
            let config = self.config.vector.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let planned = tokio::task::spawn_blocking(move || {
                    plan_page(&doc, page_number, page_id, &directives, &config)
                })
                .await;
                (page_number, planned)
            });
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page_number, Ok(Ok(plan)))) => {
                    outcomes.insert(page_number, VectorOutcome::Planned(plan));
                }
                Ok((page_number, Ok(Err(reason)))) => {
                    outcomes.insert(page_number, VectorOutcome::Unusable(reason));
                }
                Ok((page_number, Err(e))) => {
                    warn!(page = page_number, error = %e, "page analysis task failed");
                }
                Err(e) => warn!(error = %e, "page task failed"),
            }
        }
        outcomes
    }

    async fn raster_pass(
        &self,
        original: &[u8],
        routed: &[(u32, ObjectId)],
        directives: &Arc<DirectiveSet>,
    ) -> BTreeMap<u32, Result<RasterPage, RecognitionError>> {
        let mut results = BTreeMap::new();
        let (rasterizer, ocr) = match (&self.rasterizer, &self.ocr) {
            (Ok(rasterizer), Ok(ocr)) => (Arc::clone(rasterizer), Arc::clone(ocr)),
            (Err(e), _) | (_, Err(e)) => {
                for &(page_number, _) in routed {
                    results.insert(page_number, Err(e.clone()));
                }
                return results;
            }
        };

        // Request-scoped copy for the external rasterizer; removed on drop
        let file = match write_temp_document(original) {
            Ok(file) => file,
            Err(e) => {
                for &(page_number, _) in routed {
                    results.insert(page_number, Err(e.clone()));
                }
                return results;
            }
        };
        let path: PathBuf = file.path().to_path_buf();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_pages));
        let mut tasks = JoinSet::new();
        for &(page_number, _) in routed {
            let rasterizer = Arc::clone(&rasterizer);
            let ocr = Arc::clone(&ocr);
            let painter = Arc::clone(&self.painter);
            let directives = Arc::clone(directives);
            let config = self.config.raster.clone();
            let path = path.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = async {
                    let (image, words) =
                        recognize_page(rasterizer.as_ref(), ocr.as_ref(), &path, page_number, &config)
                            .await?;
                    tokio::task::spawn_blocking(move || {
                        mutate_page(page_number, image, &words, &directives, &config, &painter)
                    })
                    .await
                    .map_err(|e| RecognitionError::RecognitionFailed(format!("painting task: {}", e)))
                }
                .await;
                (page_number, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page_number, result)) => {
                    results.insert(page_number, result);
                }
                Err(e) => warn!(error = %e, "OCR task failed"),
            }
        }
        drop(file);
        results
    }

    async fn assemble(
        &self,
        doc: &mut Document,
        page_count: usize,
        format: OutputFormat,
        painted: &BTreeMap<u32, RgbImage>,
    ) -> Result<(Artifact, OutputFormat), EditError> {
        let pdf = save_document(doc)?;
        if !format.is_image() {
            return Ok((Artifact::Document(pdf), OutputFormat::Pdf));
        }

        let Some(pages) = image_pages(page_count as u32, self.config.output.multi_page_images)
        else {
            return Ok((Artifact::Document(pdf), OutputFormat::Pdf));
        };
        let rasterizer = self
            .rasterizer
            .as_ref()
            .map_err(|e| EditError::AssemblyError(e.to_string()))?;
        let images = render_images(
            &pdf,
            &pages,
            painted,
            rasterizer.as_ref(),
            format,
            &self.config.output,
        )
        .await?;
        Ok((Artifact::Images(images), format))
    }
}

fn write_temp_document(bytes: &[u8]) -> Result<tempfile::NamedTempFile, RecognitionError> {
    let mut file = tempfile::Builder::new()
        .prefix("retext-")
        .suffix(".pdf")
        .tempfile()
        .map_err(|e| RecognitionError::RasterizationFailed(format!("temp file: {}", e)))?;
    file.write_all(bytes)
        .and_then(|_| file.flush())
        .map_err(|e| RecognitionError::RasterizationFailed(format!("temp file: {}", e)))?;
    Ok(file)
}

fn page_failure(page_number: u32, message: String) -> ReportContribution {
    let mut contribution = ReportContribution::new();
    contribution.note(page_number, NoteKind::PageFailed, message);
    contribution.mark_failed(page_number);
    contribution
}

fn advance(state: &mut RequestState, next: RequestState) {
    info!(from = ?*state, to = ?next, "request state");
    *state = next;
}

fn fail(state: &mut RequestState) {
    advance(state, RequestState::Failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::test_support::{single_page, text_ops};
    use pretty_assertions::assert_eq;

    fn engine() -> ReplacementEngine {
        ReplacementEngine::from_config(EngineConfig::default()).with_painter(Painter::bitmap())
    }

    fn pdf_bytes(text: &str) -> Vec<u8> {
        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, text));
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn manual(pairs: &[(&str, &str)]) -> Instructions {
        Instructions::Manual {
            replacements: pairs
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            case_sensitive: false,
        }
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RequestState::PartiallyAssembled).unwrap(),
            "\"partially_assembled\""
        );
    }

    #[tokio::test]
    async fn test_unopenable_document_is_input_error() {
        let request = EditRequest::new(b"not a pdf".to_vec(), manual(&[("a", "b")]));
        let err = engine().run(request).await.unwrap_err();
        assert!(matches!(err, EditError::InputError(_)));
    }

    #[tokio::test]
    async fn test_empty_directives_return_input_unchanged() {
        let bytes = pdf_bytes("Invoice 2025");
        let request = EditRequest::new(bytes.clone(), manual(&[]));
        let outcome = engine().run(request).await.unwrap();
        assert_eq!(outcome.artifact, Artifact::Document(bytes));
        assert_eq!(outcome.report.total_replacements, 0);
        assert_eq!(outcome.report.state, RequestState::Assembled);
    }

    #[tokio::test]
    async fn test_text_page_replaced_through_vector_path() {
        let request = EditRequest::new(pdf_bytes("Invoice 2025"), manual(&[("2025", "2026")]));
        let outcome = engine().run(request).await.unwrap();
        assert_eq!(outcome.report.count_for("2025"), 1);
        assert_eq!(outcome.report.directives[0].vector_count, 1);
        assert!(outcome.report.raster_pages.is_empty());
        assert_eq!(outcome.report.state, RequestState::Assembled);
        assert!(matches!(outcome.artifact, Artifact::Document(_)));
    }

    #[tokio::test]
    async fn test_absent_text_counts_zero() {
        let request = EditRequest::new(pdf_bytes("Invoice 2025"), manual(&[("Quote", "Bid")]));
        let outcome = engine().run(request).await.unwrap();
        assert_eq!(outcome.report.count_for("Quote"), 0);
        assert_eq!(outcome.report.state, RequestState::Assembled);
    }
}
