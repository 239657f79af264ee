//! Engine configuration
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Secrets and deployment-specific values can be supplied
//! through `RETEXT_*` environment variables, which take precedence over the
//! file.

use crate::error::ConfigError;
use crate::geometry::Color;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_API_KEY: &str = "RETEXT_LLM_API_KEY";
pub const ENV_BASE_URL: &str = "RETEXT_LLM_BASE_URL";
pub const ENV_MODEL: &str = "RETEXT_LLM_MODEL";
pub const ENV_MAX_CONCURRENT_PAGES: &str = "RETEXT_MAX_CONCURRENT_PAGES";
pub const ENV_OCR_LANG: &str = "RETEXT_OCR_LANG";

/// Top-level configuration for a [`crate::ReplacementEngine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub raster: RasterConfig,
    #[serde(default)]
    pub translator: TranslatorConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// Upper bound on pages processed at the same time (default: 4)
    #[serde(default = "default_max_concurrent_pages")]
    pub max_concurrent_pages: usize,
    /// Deadline for a whole request in milliseconds (default: 120000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_max_concurrent_pages() -> usize {
    4
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vector: VectorConfig::default(),
            raster: RasterConfig::default(),
            translator: TranslatorConfig::default(),
            output: OutputConfig::default(),
            max_concurrent_pages: default_max_concurrent_pages(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the TOML is malformed,
    /// or a value is out of range.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RETEXT_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production)
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.translator.api_key = Some(key);
        }
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.translator.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.trim().is_empty()) {
            self.translator.model = model;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT_PAGES) {
            self.max_concurrent_pages = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be a positive integer, got '{}'", ENV_MAX_CONCURRENT_PAGES, raw))
            })?;
        }
        if let Some(lang) = lookup(ENV_OCR_LANG).filter(|v| !v.trim().is_empty()) {
            self.raster.tesseract_lang = lang;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values that would make the engine misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_pages == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_pages must be at least 1".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }

        let r = &self.raster;
        if !(0.0..=1.0).contains(&r.similarity_threshold) || r.similarity_threshold == 0.0 {
            return Err(ConfigError::Invalid(format!(
                "raster.similarity_threshold must be in (0, 1], got {}",
                r.similarity_threshold
            )));
        }
        if !(0.0..=100.0).contains(&r.confidence_floor) {
            return Err(ConfigError::Invalid(format!(
                "raster.confidence_floor must be in [0, 100], got {}",
                r.confidence_floor
            )));
        }
        if let Some(relaxed) = r.relaxed_confidence_floor {
            if !(0.0..=100.0).contains(&relaxed) || relaxed > r.confidence_floor {
                return Err(ConfigError::Invalid(format!(
                    "raster.relaxed_confidence_floor must be in [0, confidence_floor], got {}",
                    relaxed
                )));
            }
        }
        if r.dpi < 72 || r.dpi > 1200 {
            return Err(ConfigError::Invalid(format!(
                "raster.dpi must be between 72 and 1200, got {}",
                r.dpi
            )));
        }
        if r.line_gap_factor <= 0.0 {
            return Err(ConfigError::Invalid("raster.line_gap_factor must be positive".into()));
        }

        if self.output.image_dpi < 36 || self.output.image_dpi > 1200 {
            return Err(ConfigError::Invalid(format!(
                "output.image_dpi must be between 36 and 1200, got {}",
                self.output.image_dpi
            )));
        }
        if self.output.jpeg_quality == 0 || self.output.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "output.jpeg_quality must be between 1 and 100, got {}",
                self.output.jpeg_quality
            )));
        }

        if self.translator.max_directives == 0 {
            return Err(ConfigError::Invalid(
                "translator.max_directives must be at least 1".into(),
            ));
        }
        if self.vector.cover_padding < 0.0 {
            return Err(ConfigError::Invalid("vector.cover_padding must not be negative".into()));
        }
        Ok(())
    }
}

/// How a replacement wider than the text it replaces is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WidthPolicy {
    /// Keep the captured size and let the text run past the old extent
    #[default]
    KeepSize,
    /// Scale the font down until the replacement fits the old extent
    ShrinkToFit,
}

/// Replacements wider than this share of the original width get a note.
pub const OVERFLOW_NOTE_RATIO: f64 = 1.15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default)]
    pub width_policy: WidthPolicy,
    /// Extra margin, in points, around the cover rectangle (default: 1.0)
    #[serde(default = "default_cover_padding")]
    pub cover_padding: f64,
    /// Cover color used when no filled rectangle lies under the text
    #[serde(default = "default_background")]
    pub default_background: Color,
    /// Remove matched glyphs from the content stream when metrics allow it
    #[serde(default = "default_true")]
    pub strip_original_glyphs: bool,
}

fn default_cover_padding() -> f64 {
    1.0
}

fn default_background() -> Color {
    Color::WHITE
}

fn default_true() -> bool {
    true
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            width_policy: WidthPolicy::default(),
            cover_padding: default_cover_padding(),
            default_background: default_background(),
            strip_original_glyphs: true,
        }
    }
}

/// Raster fallback tuning. Thresholds are deliberately configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterConfig {
    /// Rasterization resolution (default: 300)
    #[serde(default = "default_raster_dpi")]
    pub dpi: u32,
    #[serde(default)]
    pub width_policy: WidthPolicy,
    /// Minimum normalized similarity for a candidate, in (0, 1] (default: 0.8)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Minimum per-word OCR confidence, 0-100 (default: 60)
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Floor for the single retry pass; `None` disables the retry (default: 40)
    #[serde(default = "default_relaxed_confidence_floor")]
    pub relaxed_confidence_floor: Option<f64>,
    /// Maximum word gap inside a phrase, as a multiple of word height (default: 1.5)
    #[serde(default = "default_line_gap_factor")]
    pub line_gap_factor: f64,
    /// TrueType font used for painting; system fonts are tried when unset
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default)]
    pub pdftoppm_path: Option<PathBuf>,
    #[serde(default)]
    pub tesseract_path: Option<PathBuf>,
    #[serde(default = "default_tesseract_lang")]
    pub tesseract_lang: String,
    /// Per-page deadline for rasterization and OCR (default: 60000)
    #[serde(default = "default_ocr_timeout_ms")]
    pub ocr_timeout_ms: u64,
}

fn default_raster_dpi() -> u32 {
    300
}

fn default_similarity_threshold() -> f64 {
    0.8
}

fn default_confidence_floor() -> f64 {
    60.0
}

fn default_relaxed_confidence_floor() -> Option<f64> {
    Some(40.0)
}

fn default_line_gap_factor() -> f64 {
    1.5
}

fn default_tesseract_lang() -> String {
    "eng".to_string()
}

fn default_ocr_timeout_ms() -> u64 {
    60_000
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            dpi: default_raster_dpi(),
            width_policy: WidthPolicy::default(),
            similarity_threshold: default_similarity_threshold(),
            confidence_floor: default_confidence_floor(),
            relaxed_confidence_floor: default_relaxed_confidence_floor(),
            line_gap_factor: default_line_gap_factor(),
            font_path: None,
            pdftoppm_path: None,
            tesseract_path: None,
            tesseract_lang: default_tesseract_lang(),
            ocr_timeout_ms: default_ocr_timeout_ms(),
        }
    }
}

/// Settings for the chat-completions service behind the prompt mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatorConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Never written back out; normally supplied through `RETEXT_LLM_API_KEY`
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Per-attempt timeout (default: 30000)
    #[serde(default = "default_translator_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay before the single retry of a transient failure (default: 500)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_directives")]
    pub max_directives: usize,
    /// Case flag for entries that specify none
    #[serde(default)]
    pub default_case_sensitive: bool,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_translator_timeout_ms() -> u64 {
    30_000
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_directives() -> usize {
    64
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            timeout_ms: default_translator_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_directives: default_max_directives(),
            default_case_sensitive: false,
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

/// What to produce when an image format is requested for a multi-page document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MultiPageImagePolicy {
    /// One image per page
    #[default]
    EveryPage,
    /// Only the first page
    FirstPageOnly,
    /// Fall back to the reassembled PDF
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Resolution for image output (default: 200)
    #[serde(default = "default_image_dpi")]
    pub image_dpi: u32,
    /// JPEG quality, 1-100 (default: 95)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default)]
    pub multi_page_images: MultiPageImagePolicy,
}

fn default_image_dpi() -> u32 {
    200
}

fn default_jpeg_quality() -> u8 {
    95
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            image_dpi: default_image_dpi(),
            jpeg_quality: default_jpeg_quality(),
            multi_page_images: MultiPageImagePolicy::default(),
        }
    }
}
