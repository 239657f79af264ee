//! Output artifact assembly
//!
//! Raster-mutated pages become image-only pages in the document. Image
//! output renders the mutated document page by page, reusing painted images
//! where the raster path already produced one.

use crate::config::{MultiPageImagePolicy, OutputConfig};
use crate::error::EditError;
use crate::extraction::{media_box, page_rotation};
use crate::raster::PageRasterizer;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use tracing::debug;

const PAGE_IMAGE_RESOURCE: &str = "RtPageImage";

/// Output format for the edited artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pdf,
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
}

impl OutputFormat {
    /// Get the MIME type for this format
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, OutputFormat::Pdf)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Pdf => write!(f, "pdf"),
            OutputFormat::Png => write!(f, "png"),
            OutputFormat::Jpeg => write!(f, "jpeg"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pdf" => Ok(OutputFormat::Pdf),
            "png" => Ok(OutputFormat::Png),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

/// One encoded page image
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub page_number: u32,
    pub format: OutputFormat,
    pub bytes: Vec<u8>,
}

/// The edited document, or one image per page
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Document(Vec<u8>),
    Images(Vec<PageImage>),
}

impl Artifact {
    /// Format actually produced
    pub fn format(&self) -> OutputFormat {
        match self {
            Artifact::Document(_) => OutputFormat::Pdf,
            Artifact::Images(images) => images
                .first()
                .map(|i| i.format)
                .unwrap_or(OutputFormat::Png),
        }
    }
}

/// Replace a page's content with a single full-page image.
///
/// The page is normalized to an unrotated MediaBox matching the image's
/// orientation, since the rendered image already has /Rotate applied.
pub fn replace_with_image(
    doc: &mut Document,
    page_id: ObjectId,
    image: &RgbImage,
) -> Result<(), EditError> {
    let area = media_box(doc, page_id);
    let (width, height) = match page_rotation(doc, page_id) {
        90 | 270 => (area.height(), area.width()),
        _ => (area.width(), area.height()),
    };

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(image.as_raw())
        .map_err(|e| EditError::AssemblyError(format!("compressing page image: {}", e)))?;
    let pixels = encoder
        .finish()
        .map_err(|e| EditError::AssemblyError(format!("compressing page image: {}", e)))?;

    let image_stream = Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => image.width() as i64,
            "Height" => image.height() as i64,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        },
        pixels,
    )
    .with_compression(false);
    let image_id = doc.add_object(image_stream);

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Real(width as f32),
                    0.into(),
                    0.into(),
                    Object::Real(height as f32),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(PAGE_IMAGE_RESOURCE.as_bytes().to_vec())]),
            Operation::new("Q", vec![]),
        ],
    }
    .encode()
    .map_err(|e| EditError::AssemblyError(format!("encoding page content: {}", e)))?;
    let content_id = doc.add_object(Stream::new(dictionary! {}, content));

    let page = doc
        .get_object_mut(page_id)
        .and_then(|o| o.as_dict_mut())
        .map_err(|e| EditError::AssemblyError(format!("page object: {}", e)))?;
    page.set("Contents", Object::Reference(content_id));
    page.set(
        "Resources",
        dictionary! {
            "XObject" => dictionary! {
                PAGE_IMAGE_RESOURCE => Object::Reference(image_id),
            },
        },
    );
    page.set(
        "MediaBox",
        vec![
            0.into(),
            0.into(),
            Object::Real(width as f32),
            Object::Real(height as f32),
        ],
    );
    page.set("Rotate", 0);
    page.remove(b"CropBox");

    debug!(
        page_id = ?page_id,
        width = image.width(),
        height = image.height(),
        "page replaced by image"
    );
    Ok(())
}

/// Drop orphaned objects, compress and serialize.
pub fn save_document(doc: &mut Document) -> Result<Vec<u8>, EditError> {
    doc.prune_objects();
    doc.compress();

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| EditError::AssemblyError(format!("Save failed: {}", e)))?;
    Ok(buffer)
}

pub fn encode_image(
    image: &RgbImage,
    format: OutputFormat,
    jpeg_quality: u8,
) -> Result<Vec<u8>, EditError> {
    let mut buffer = Vec::new();
    match format {
        OutputFormat::Png => image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .map_err(|e| EditError::AssemblyError(format!("PNG encoding: {}", e)))?,
        OutputFormat::Jpeg => JpegEncoder::new_with_quality(&mut buffer, jpeg_quality)
            .encode_image(image)
            .map_err(|e| EditError::AssemblyError(format!("JPEG encoding: {}", e)))?,
        OutputFormat::Pdf => {
            return Err(EditError::AssemblyError(
                "PDF is not an image format".to_string(),
            ))
        }
    }
    Ok(buffer)
}

/// Pages to render for image output, or `None` when the policy falls back
/// to the document.
pub fn image_pages(page_count: u32, policy: MultiPageImagePolicy) -> Option<Vec<u32>> {
    match policy {
        MultiPageImagePolicy::EveryPage => Some((1..=page_count).collect()),
        MultiPageImagePolicy::FirstPageOnly => Some((1..=page_count.min(1)).collect()),
        MultiPageImagePolicy::Document if page_count > 1 => None,
        MultiPageImagePolicy::Document => Some((1..=page_count).collect()),
    }
}

/// Encode the requested pages of `pdf` as images. Pages present in
/// `painted` reuse that image; the rest are rasterized at the output DPI.
pub async fn render_images(
    pdf: &[u8],
    pages: &[u32],
    painted: &BTreeMap<u32, RgbImage>,
    rasterizer: &dyn PageRasterizer,
    format: OutputFormat,
    config: &OutputConfig,
) -> Result<Vec<PageImage>, EditError> {
    let needs_render = pages.iter().any(|p| !painted.contains_key(p));
    let file = if needs_render {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| EditError::AssemblyError(format!("temp file: {}", e)))?;
        file.write_all(pdf)
            .and_then(|_| file.flush())
            .map_err(|e| EditError::AssemblyError(format!("temp file: {}", e)))?;
        Some(file)
    } else {
        None
    };

    let mut images = Vec::with_capacity(pages.len());
    for &page_number in pages {
        let bytes = match (painted.get(&page_number), &file) {
            (Some(image), _) => encode_image(image, format, config.jpeg_quality)?,
            (None, Some(file)) => {
                let image = rasterizer
                    .rasterize(file.path(), page_number, config.image_dpi)
                    .await
                    .map_err(|e| {
                        EditError::AssemblyError(format!("rendering page {}: {}", page_number, e))
                    })?;
                encode_image(&image, format, config.jpeg_quality)?
            }
            (None, None) => {
                return Err(EditError::AssemblyError(format!(
                    "page {} has no image",
                    page_number
                )))
            }
        };
        images.push(PageImage {
            page_number,
            format,
            bytes,
        });
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::test_support::{single_page, text_ops};
    use image::Rgb;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("PDF".parse::<OutputFormat>().unwrap(), OutputFormat::Pdf);
        assert_eq!("jpg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("jpeg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert!("tiff".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(OutputFormat::Png.extension(), "png");
        let parsed: OutputFormat = serde_json::from_str("\"jpg\"").unwrap();
        assert_eq!(parsed, OutputFormat::Jpeg);
        assert_eq!(serde_json::to_string(&OutputFormat::Pdf).unwrap(), "\"pdf\"");
    }

    #[test]
    fn test_image_page_policies() {
        assert_eq!(image_pages(3, MultiPageImagePolicy::EveryPage), Some(vec![1, 2, 3]));
        assert_eq!(image_pages(3, MultiPageImagePolicy::FirstPageOnly), Some(vec![1]));
        assert_eq!(image_pages(3, MultiPageImagePolicy::Document), None);
        assert_eq!(image_pages(1, MultiPageImagePolicy::Document), Some(vec![1]));
    }

    #[test]
    fn test_replace_with_image_builds_image_page() {
        let mut doc = single_page(text_ops(72.0, 700.0, 12.0, "Scanned"));
        let page_id = *doc.get_pages().get(&1).unwrap();
        let image = RgbImage::from_pixel(20, 30, Rgb([200, 10, 10]));

        replace_with_image(&mut doc, page_id, &image).unwrap();
        let bytes = save_document(&mut doc).unwrap();

        let reloaded = Document::load_mem(&bytes).unwrap();
        let page_id = *reloaded.get_pages().get(&1).unwrap();
        let page = reloaded.get_dictionary(page_id).unwrap();
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
        let image_ref = xobjects
            .get(PAGE_IMAGE_RESOURCE.as_bytes())
            .unwrap()
            .as_reference()
            .unwrap();
        let stream = reloaded.get_object(image_ref).unwrap().as_stream().unwrap();
        assert_eq!(stream.dict.get(b"Width").unwrap().as_i64().unwrap(), 20);
        assert_eq!(stream.dict.get(b"Height").unwrap().as_i64().unwrap(), 30);

        // old text is gone from the page
        let content = reloaded.get_page_content(page_id).unwrap();
        let ops = Content::decode(&content).unwrap().operations;
        assert!(ops.iter().all(|op| op.operator != "Tj"));
        assert!(ops.iter().any(|op| op.operator == "Do"));
    }

    #[test]
    fn test_encode_png_and_jpeg() {
        let image = RgbImage::from_pixel(8, 8, Rgb([255, 255, 255]));
        let png = encode_image(&image, OutputFormat::Png, 95).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        let jpeg = encode_image(&image, OutputFormat::Jpeg, 95).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(encode_image(&image, OutputFormat::Pdf, 95).is_err());
    }

    #[test]
    fn test_artifact_reports_produced_format() {
        assert_eq!(Artifact::Document(vec![]).format(), OutputFormat::Pdf);
        let images = Artifact::Images(vec![PageImage {
            page_number: 1,
            format: OutputFormat::Jpeg,
            bytes: vec![],
        }]);
        assert_eq!(images.format(), OutputFormat::Jpeg);
    }
}
