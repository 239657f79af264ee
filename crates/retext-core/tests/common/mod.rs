//! Shared fixtures: in-process PDFs and fake raster/OCR/translator backends

#![allow(dead_code)]

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use retext_core::error::{RecognitionError, TransportError};
use retext_core::raster::{OcrEngine, OcrWord, PageRasterizer, Painter, PixelBox};
use retext_core::translator::{Completion, CompletionClient, CompletionRequest};
use retext_core::{EngineConfig, ReplacementEngine};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub enum PageSpec<'a> {
    /// One line of Helvetica text at the top of the page
    Text(&'a str),
    /// One line of text in a font of the shared resources:
    /// `F1` Helvetica, `F2` Times-Roman, `F3` Courier
    Styled { text: &'a str, font: &'a str },
    /// Only a filled background, no text layer
    Scanned,
}

/// Where pages find their resource dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLayout {
    /// Every page points at the same indirect `/Resources` object
    Shared,
    /// Pages have no `/Resources`; they inherit it from the page tree
    Inherited,
}

fn text_line(font: &str, text: &str) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![font.into(), 12.into()]),
        Operation::new("Td", vec![72.into(), 700.into()]),
        Operation::new("Tj", vec![Object::string_literal(text)]),
        Operation::new("ET", vec![]),
    ]
}

pub fn build_pdf(pages: &[PageSpec]) -> Vec<u8> {
    build_pdf_with(pages, ResourceLayout::Shared)
}

pub fn build_pdf_with(pages: &[PageSpec], layout: ResourceLayout) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut fonts = lopdf::Dictionary::new();
    for (name, base_font) in [("F1", "Helvetica"), ("F2", "Times-Roman"), ("F3", "Courier")] {
        let id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => base_font,
        });
        fonts.set(name, id);
    }
    let resources_id = doc.add_object(dictionary! {
        "Font" => fonts,
    });

    let mut kids: Vec<Object> = Vec::new();
    for page in pages {
        let operations = match page {
            PageSpec::Text(text) => text_line("F1", text),
            PageSpec::Styled { text, font } => text_line(font, text),
            PageSpec::Scanned => vec![
                Operation::new("g", vec![Object::Real(0.95)]),
                Operation::new("re", vec![0.into(), 0.into(), 612.into(), 792.into()]),
                Operation::new("f", vec![]),
            ],
        };
        let content = Content { operations }.encode().unwrap();
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));
        let mut page = dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        };
        if layout == ResourceLayout::Shared {
            page.set("Resources", resources_id);
        }
        kids.push(doc.add_object(page).into());
    }

    let mut tree = dictionary! {
        "Type" => "Pages",
        "Count" => kids.len() as i64,
        "Kids" => kids,
    };
    if layout == ResourceLayout::Inherited {
        tree.set("Resources", resources_id);
    }
    doc.objects.insert(pages_id, Object::Dictionary(tree));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// Renders every page as a blank white image and counts calls
#[derive(Default)]
pub struct BlankRasterizer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl PageRasterizer for BlankRasterizer {
    fn name(&self) -> &'static str {
        "blank"
    }

    async fn rasterize(
        &self,
        document: &Path,
        _page: u32,
        _dpi: u32,
    ) -> Result<RgbImage, RecognitionError> {
        assert!(document.exists(), "rasterizer got a missing file");
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RgbImage::from_pixel(850, 1100, Rgb([255, 255, 255])))
    }
}

/// Returns the same words for every image
pub struct ScriptedOcr {
    pub words: Vec<OcrWord>,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl ScriptedOcr {
    pub fn new(words: Vec<OcrWord>) -> Self {
        Self {
            words,
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn recognize(&self, _image: &RgbImage) -> Result<Vec<OcrWord>, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.words.clone())
    }
}

pub struct FailingOcr;

#[async_trait]
impl OcrEngine for FailingOcr {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn recognize(&self, _image: &RgbImage) -> Result<Vec<OcrWord>, RecognitionError> {
        Err(RecognitionError::EngineUnavailable("tesseract not installed".into()))
    }
}

/// Chat endpoint that always answers with `content`
pub struct FixedCompletion {
    pub content: String,
}

#[async_trait]
impl CompletionClient for FixedCompletion {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, TransportError> {
        Ok(Completion {
            content: self.content.clone(),
            ..Completion::default()
        })
    }
}

/// "Invoice 2025" as recognized on a scanned page
pub fn invoice_words() -> Vec<OcrWord> {
    vec![
        OcrWord::new("Invoice", PixelBox::new(100, 100, 160, 40), 96.0),
        OcrWord::new("2025", PixelBox::new(280, 100, 100, 40), 93.0),
    ]
}

pub fn engine_with(config: EngineConfig, ocr: Arc<dyn OcrEngine>) -> ReplacementEngine {
    ReplacementEngine::from_config(config)
        .with_rasterizer(Arc::new(BlankRasterizer::default()))
        .with_ocr_engine(ocr)
        .with_painter(Painter::bitmap())
}

pub fn engine(ocr: Arc<dyn OcrEngine>) -> ReplacementEngine {
    engine_with(EngineConfig::default(), ocr)
}
