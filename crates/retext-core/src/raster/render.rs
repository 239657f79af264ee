//! Page rasterization

use crate::config::RasterConfig;
use crate::error::RecognitionError;
use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Turns one page of a PDF into an RGB image.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// `page` is 1-based.
    async fn rasterize(
        &self,
        document: &Path,
        page: u32,
        dpi: u32,
    ) -> Result<RgbImage, RecognitionError>;
}

/// Rasterizer backed by poppler's `pdftoppm`
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    binary: PathBuf,
}

impl PdftoppmRasterizer {
    pub fn from_config(config: &RasterConfig) -> Result<Self, RecognitionError> {
        let binary = match &config.pdftoppm_path {
            Some(path) => path.clone(),
            None => which::which("pdftoppm").map_err(|e| {
                RecognitionError::RasterizerUnavailable(format!("pdftoppm: {}", e))
            })?,
        };
        Ok(Self { binary })
    }
}

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    fn name(&self) -> &'static str {
        "pdftoppm"
    }

    async fn rasterize(
        &self,
        document: &Path,
        page: u32,
        dpi: u32,
    ) -> Result<RgbImage, RecognitionError> {
        let dir = tempfile::tempdir()
            .map_err(|e| RecognitionError::RasterizationFailed(format!("temp dir: {}", e)))?;
        let prefix = dir.path().join("page");

        let output = Command::new(&self.binary)
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg("-png")
            .arg("-singlefile")
            .arg(document)
            .arg(&prefix)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RecognitionError::RasterizerUnavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(RecognitionError::RasterizationFailed(format!(
                "pdftoppm exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let png = prefix.with_extension("png");
        let image = image::open(&png)
            .map_err(|e| RecognitionError::RasterizationFailed(format!("reading {}: {}", png.display(), e)))?
            .to_rgb8();
        debug!(
            page,
            dpi,
            width = image.width(),
            height = image.height(),
            "page rasterized"
        );
        Ok(image)
    }
}
