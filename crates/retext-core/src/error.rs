use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Request-level failures. Only these reach the caller; page-level problems
/// are absorbed into the report.
#[derive(Error, Debug)]
pub enum EditError {
    #[error("Could not process this document: {0}")]
    InputError(String),

    #[error("Could not understand the instructions: {0}")]
    ParseError(#[from] ParseError),

    #[error("No page could be processed: {0}")]
    AllPagesFailed(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Failed to assemble output: {0}")]
    AssemblyError(String),
}

/// Coarse classification for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The instructions could not be turned into directives
    Instructions,
    /// The document could not be opened, processed or assembled
    Document,
    /// The request ran out of time or was cancelled
    Cancelled,
}

impl EditError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EditError::ParseError(_) => FailureKind::Instructions,
            EditError::Cancelled(_) => FailureKind::Cancelled,
            EditError::InputError(_)
            | EditError::AllPagesFailed(_)
            | EditError::AssemblyError(_) => FailureKind::Document,
        }
    }
}

/// Instruction translator failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Instruction service unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed instruction response: {0}")]
    MalformedResponse(String),

    #[error("No usable directives: {0}")]
    NoUsableDirectives(String),
}

/// Failures talking to the completion endpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Completion endpoint not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unreadable response body: {0}")]
    InvalidBody(String),
}

impl TransportError {
    /// Worth one more attempt: timeouts, connection errors, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connection(_) => true,
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
            TransportError::NotConfigured(_) | TransportError::InvalidBody(_) => false,
        }
    }
}

/// Why a page's text layer could not be used. Never surfaced on its own:
/// the page is routed to the raster path instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Content stream unreadable: {0}")]
    ContentUnreadable(String),

    #[error("Page has no text layer")]
    NoTextLayer,

    #[error("Text layer is garbled: {0}")]
    Garbled(String),
}

/// Raster path failures for a single page.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecognitionError {
    #[error("Rasterizer unavailable: {0}")]
    RasterizerUnavailable(String),

    #[error("Rasterization failed: {0}")]
    RasterizationFailed(String),

    #[error("OCR engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("OCR failed: {0}")]
    RecognitionFailed(String),

    #[error("OCR timed out after {0}ms")]
    Timeout(u64),
}

/// Writing a planned page edit back into the document failed. The page is
/// passed through unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error("Failed to encode content stream: {0}")]
    Encode(String),

    #[error("Page resources unusable: {0}")]
    Resources(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DirectiveError {
    #[error("Directive original text is empty")]
    EmptyOriginal,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
