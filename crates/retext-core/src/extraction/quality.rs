//! Text layer quality checks
//!
//! Decides whether decoded page text can be matched against. Fonts without a
//! usable Unicode mapping decode into replacement characters or Private Use
//! Area code points; searching such text silently finds nothing, so the page
//! is handed to OCR instead.

use crate::error::ExtractionError;

/// Share of undecodable glyphs above which the page goes to OCR
const MAX_UNDECODABLE_SHARE: f64 = 0.15;
/// Share of Private Use Area glyphs above which the page goes to OCR
const MAX_PRIVATE_USE_SHARE: f64 = 0.10;

/// Glyph counts of a page's decoded text, whitespace excluded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlyphCensus {
    pub visible: usize,
    /// U+FFFD, emitted when a code has no mapping at all
    pub replacement: usize,
    /// Codes of Type0 fonts without ToUnicode
    pub private_use: usize,
    pub control: usize,
}

impl GlyphCensus {
    pub fn of(text: &str) -> Self {
        let mut census = Self::default();
        for c in text.chars().filter(|c| !c.is_whitespace()) {
            census.visible += 1;
            match c {
                '\u{FFFD}' => census.replacement += 1,
                '\u{E000}'..='\u{F8FF}' => census.private_use += 1,
                '\u{0000}'..='\u{001F}' => census.control += 1,
                _ => {}
            }
        }
        census
    }

    pub fn undecodable(&self) -> usize {
        self.replacement + self.private_use + self.control
    }

    fn share(&self, count: usize) -> f64 {
        if self.visible == 0 {
            return 1.0;
        }
        count as f64 / self.visible as f64
    }
}

/// Check that the decoded text of a page is usable for matching.
///
/// Returns the census when the vector path can work on the page, else the
/// reason the page has to be rasterized.
pub fn check_text_layer(text: &str) -> Result<GlyphCensus, ExtractionError> {
    let census = GlyphCensus::of(text);
    if census.visible == 0 {
        return Err(ExtractionError::NoTextLayer);
    }

    if census.share(census.undecodable()) > MAX_UNDECODABLE_SHARE {
        return Err(ExtractionError::Garbled(format!(
            "{} of {} glyphs do not decode to text",
            census.undecodable(),
            census.visible
        )));
    }
    if census.share(census.private_use) > MAX_PRIVATE_USE_SHARE {
        return Err(ExtractionError::Garbled(format!(
            "{} of {} glyphs decode into the Private Use Area (font has no Unicode map)",
            census.private_use, census.visible
        )));
    }
    Ok(census)
}
