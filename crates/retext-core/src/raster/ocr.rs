//! Word-level OCR
//!
//! The engine is a trait so tests (and other deployments) can plug in their
//! own recognizer. The default runs the `tesseract` command line tool and
//! reads its TSV output.

use crate::config::RasterConfig;
use crate::error::RecognitionError;
use async_trait::async_trait;
use image::RgbImage;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Axis-aligned box in image pixels, origin at the top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelBox {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelBox {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.top + self.height
    }

    pub fn center_y(&self) -> f64 {
        self.top as f64 + self.height as f64 / 2.0
    }

    pub fn union(&self, other: &PixelBox) -> PixelBox {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        PixelBox::new(left, top, right - left, bottom - top)
    }
}

/// One recognized word
#[derive(Debug, Clone, PartialEq)]
pub struct OcrWord {
    pub text: String,
    pub bbox: PixelBox,
    /// 0-100
    pub confidence: f64,
}

impl OcrWord {
    pub fn new(text: impl Into<String>, bbox: PixelBox, confidence: f64) -> Self {
        Self {
            text: text.into(),
            bbox,
            confidence,
        }
    }
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine identifier for logs
    fn name(&self) -> &'static str;

    async fn recognize(&self, image: &RgbImage) -> Result<Vec<OcrWord>, RecognitionError>;
}

/// OCR through the `tesseract` binary
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: PathBuf,
    lang: String,
}

impl TesseractEngine {
    /// Locate the binary (configured path or `PATH`).
    pub fn from_config(config: &RasterConfig) -> Result<Self, RecognitionError> {
        let binary = match &config.tesseract_path {
            Some(path) => path.clone(),
            None => which::which("tesseract")
                .map_err(|e| RecognitionError::EngineUnavailable(format!("tesseract: {}", e)))?,
        };
        Ok(Self {
            binary,
            lang: config.tesseract_lang.clone(),
        })
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    async fn recognize(&self, image: &RgbImage) -> Result<Vec<OcrWord>, RecognitionError> {
        let dir = tempfile::tempdir()
            .map_err(|e| RecognitionError::RecognitionFailed(format!("temp dir: {}", e)))?;
        let input = dir.path().join("page.png");
        image
            .save(&input)
            .map_err(|e| RecognitionError::RecognitionFailed(format!("writing image: {}", e)))?;

        let output = Command::new(&self.binary)
            .arg(&input)
            .arg("stdout")
            .arg("-l")
            .arg(&self.lang)
            .arg("tsv")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RecognitionError::EngineUnavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(RecognitionError::RecognitionFailed(format!(
                "tesseract exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let words = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!(words = words.len(), lang = %self.lang, "tesseract finished");
        Ok(words)
    }
}

/// Parse tesseract TSV output into words. Rows other than level 5 (word)
/// and rows with empty text are skipped.
pub fn parse_tsv(tsv: &str) -> Vec<OcrWord> {
    tsv.lines()
        .skip_while(|l| l.starts_with("level"))
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let text = cols[11..].join("\t").trim().to_string();
            if text.is_empty() {
                return None;
            }
            let left = cols[6].parse().ok()?;
            let top = cols[7].parse().ok()?;
            let width = cols[8].parse().ok()?;
            let height = cols[9].parse().ok()?;
            let confidence: f64 = cols[10].parse().ok()?;
            if width == 0 || height == 0 {
                return None;
            }
            Some(OcrWord::new(
                text,
                PixelBox::new(left, top, width, height),
                confidence.max(0.0),
            ))
        })
        .collect()
}

pub(crate) fn timeout_of(config: &RasterConfig) -> Duration {
    Duration::from_millis(config.ocr_timeout_ms)
}
