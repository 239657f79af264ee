//! Find-and-replace for text in PDF documents
//!
//! This crate rewrites text in place while preserving layout:
//! - Pages with a usable text layer are edited in their content streams
//!   (`vector`): the old text is covered, optionally removed, and the
//!   replacement is drawn with a matching standard font.
//! - Scanned pages go through OCR (`raster`): the page is rasterized, words
//!   are matched fuzzily and repainted, and the page becomes an image.
//!
//! Edits come either as explicit pairs or as a free-text prompt that the
//! `translator` turns into directives. [`ReplacementEngine`] drives a request
//! end to end and returns the artifact with a [`ReplacementReport`].

pub mod assemble;
pub mod config;
pub mod directive;
pub mod error;
pub mod extraction;
pub mod fonts;
pub mod geometry;
pub mod locator;
pub mod orchestrator;
pub mod raster;
pub mod report;
pub mod translator;
pub mod vector;

pub use assemble::{Artifact, OutputFormat, PageImage};
pub use config::{EngineConfig, MultiPageImagePolicy, WidthPolicy};
pub use directive::{Directive, DirectiveSet};
pub use error::{EditError, FailureKind, ParseError};
pub use orchestrator::{EditOutcome, EditRequest, Instructions, ReplacementEngine, RequestState};
pub use report::{ReplacementReport, ReportContribution};
pub use translator::{CompletionClient, Translator};

/// Parse PDF bytes and return page count
pub fn get_page_count(bytes: &[u8]) -> Result<u32, EditError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| EditError::InputError(e.to_string()))?;
    Ok(doc.get_pages().len() as u32)
}
