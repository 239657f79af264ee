//! Font resources as seen by the text interpreter: code width, Unicode
//! mapping and glyph advances.

use super::cmap::ToUnicodeMap;
use crate::fonts::{self, FALLBACK_WIDTH};
use lopdf::{Dictionary, Document, Object};
use std::collections::HashMap;

/// One decoded glyph of a shown string
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedGlyph {
    /// Byte range of the code inside the string operand
    pub byte_start: usize,
    pub byte_end: usize,
    pub text: String,
    /// Advance in 1/1000 text space units
    pub width: f64,
    pub exact: bool,
    /// Single-byte code 32, which receives word spacing
    pub is_word_space: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Widths {
    Simple {
        first_char: u32,
        widths: Vec<f64>,
        missing_width: Option<f64>,
    },
    Composite {
        widths: HashMap<u32, f64>,
        default_width: f64,
    },
    Standard(&'static str),
    Approximate(&'static str),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FontInfo {
    pub base_font: String,
    two_byte: bool,
    to_unicode: Option<ToUnicodeMap>,
    differences: HashMap<u8, char>,
    widths: Widths,
}

impl FontInfo {
    /// Font used when `Tf` names a resource that does not exist.
    pub fn unknown() -> Self {
        Self {
            base_font: "Helvetica".to_string(),
            two_byte: false,
            to_unicode: None,
            differences: HashMap::new(),
            widths: Widths::Unknown,
        }
    }

    pub fn from_dict(doc: &Document, dict: &Dictionary) -> Self {
        let subtype = name_of(dict.get(b"Subtype").ok());
        let base_font = name_of(dict.get(b"BaseFont").ok()).unwrap_or_else(|| "Unknown".to_string());
        let two_byte = subtype.as_deref() == Some("Type0");

        let to_unicode = dict
            .get(b"ToUnicode")
            .ok()
            .and_then(|o| stream_bytes(doc, o))
            .map(|bytes| ToUnicodeMap::parse(&bytes))
            .filter(|m| !m.is_empty());

        let differences = if two_byte {
            HashMap::new()
        } else {
            read_differences(doc, dict)
        };

        let widths = if two_byte {
            composite_widths(doc, dict)
        } else {
            simple_widths(doc, dict, &base_font)
        };

        Self {
            base_font,
            two_byte,
            to_unicode,
            differences,
            widths,
        }
    }

    /// Standard 14 font used to draw replacements for text in this font.
    pub fn standard_name(&self) -> &'static str {
        fonts::map_to_standard_font(&self.base_font)
    }

    /// Split a shown string into glyphs.
    pub fn decode(&self, bytes: &[u8]) -> Vec<DecodedGlyph> {
        let step = if self.two_byte { 2 } else { 1 };
        let mut glyphs = Vec::with_capacity(bytes.len() / step + 1);
        let mut start = 0;
        while start < bytes.len() {
            let end = (start + step).min(bytes.len());
            let code = bytes[start..end]
                .iter()
                .fold(0u32, |acc, &b| (acc << 8) | b as u32);
            let (width, exact) = self.width_of(code);
            glyphs.push(DecodedGlyph {
                byte_start: start,
                byte_end: end,
                text: self.unicode_of(code),
                width,
                exact,
                is_word_space: !self.two_byte && code == 32,
            });
            start = end;
        }
        glyphs
    }

    fn unicode_of(&self, code: u32) -> String {
        if let Some(text) = self.to_unicode.as_ref().and_then(|m| m.get(code)) {
            return text.to_string();
        }
        if self.two_byte {
            // No mapping: keep the glyph identifiable but mark it as unusable text
            let pua = 0xE000 + (code % 0x1900);
            return char::from_u32(pua)
                .unwrap_or(char::REPLACEMENT_CHARACTER)
                .to_string();
        }
        let byte = code as u8;
        if let Some(&c) = self.differences.get(&byte) {
            return c.to_string();
        }
        fonts::decode_win_ansi(byte).to_string()
    }

    fn width_of(&self, code: u32) -> (f64, bool) {
        match &self.widths {
            Widths::Simple {
                first_char,
                widths,
                missing_width,
            } => {
                let idx = code.checked_sub(*first_char).map(|i| i as usize);
                match idx.and_then(|i| widths.get(i)) {
                    Some(&w) => (w, true),
                    None => match missing_width {
                        Some(w) => (*w, true),
                        None => (FALLBACK_WIDTH, false),
                    },
                }
            }
            Widths::Composite {
                widths,
                default_width,
            } => (widths.get(&code).copied().unwrap_or(*default_width), true),
            Widths::Standard(name) => {
                fonts::standard_width(name, code as u8).unwrap_or((FALLBACK_WIDTH, false))
            }
            Widths::Approximate(name) => (
                fonts::standard_width(name, code as u8)
                    .map(|(w, _)| w)
                    .unwrap_or(FALLBACK_WIDTH),
                false,
            ),
            Widths::Unknown => (FALLBACK_WIDTH, false),
        }
    }
}

fn simple_widths(doc: &Document, dict: &Dictionary, base_font: &str) -> Widths {
    let first_char = dict
        .get(b"FirstChar")
        .ok()
        .and_then(|o| number(doc, o))
        .map(|n| n.max(0.0) as u32);
    let widths = dict
        .get(b"Widths")
        .ok()
        .and_then(|o| resolve(doc, o).as_array().ok())
        .map(|arr| {
            arr.iter()
                .map(|w| number(doc, w).unwrap_or(0.0))
                .collect::<Vec<_>>()
        });

    if let (Some(first_char), Some(widths)) = (first_char, widths) {
        let missing_width = dict
            .get(b"FontDescriptor")
            .ok()
            .and_then(|o| resolve(doc, o).as_dict().ok())
            .and_then(|fd| fd.get(b"MissingWidth").ok())
            .and_then(|o| number(doc, o));
        return Widths::Simple {
            first_char,
            widths,
            missing_width,
        };
    }

    let standard = fonts::map_to_standard_font(base_font);
    if fonts::has_exact_standard_metrics(base_font) {
        Widths::Standard(standard)
    } else if fonts::standard_width(standard, b'n').is_some() {
        Widths::Approximate(standard)
    } else {
        Widths::Unknown
    }
}

fn composite_widths(doc: &Document, dict: &Dictionary) -> Widths {
    let descendant = dict
        .get(b"DescendantFonts")
        .ok()
        .and_then(|o| resolve(doc, o).as_array().ok())
        .and_then(|arr| arr.first())
        .and_then(|o| resolve(doc, o).as_dict().ok());

    let Some(cid_font) = descendant else {
        return Widths::Unknown;
    };

    let default_width = cid_font
        .get(b"DW")
        .ok()
        .and_then(|o| number(doc, o))
        .unwrap_or(1000.0);
    let mut widths = HashMap::new();

    if let Some(w) = cid_font
        .get(b"W")
        .ok()
        .and_then(|o| resolve(doc, o).as_array().ok())
    {
        // Either `c [w1 w2 ...]` or `c_first c_last w`
        let mut i = 0;
        while i < w.len() {
            let Some(first) = number(doc, &w[i]) else {
                break;
            };
            let first = first as u32;
            match w.get(i + 1).map(|o| resolve(doc, o)) {
                Some(Object::Array(list)) => {
                    for (offset, item) in list.iter().enumerate() {
                        if let Some(width) = number(doc, item) {
                            widths.insert(first + offset as u32, width);
                        }
                    }
                    i += 2;
                }
                Some(last) => {
                    let (Some(last), Some(width)) =
                        (number(doc, last), w.get(i + 2).and_then(|o| number(doc, o)))
                    else {
                        break;
                    };
                    let last = last as u32;
                    if last >= first && last - first <= 0xFFFF {
                        for code in first..=last {
                            widths.insert(code, width);
                        }
                    }
                    i += 3;
                }
                None => break,
            }
        }
    }

    Widths::Composite {
        widths,
        default_width,
    }
}

fn read_differences(doc: &Document, dict: &Dictionary) -> HashMap<u8, char> {
    let mut out = HashMap::new();
    let Some(encoding) = dict
        .get(b"Encoding")
        .ok()
        .and_then(|o| resolve(doc, o).as_dict().ok())
    else {
        return out;
    };
    let Some(diffs) = encoding
        .get(b"Differences")
        .ok()
        .and_then(|o| resolve(doc, o).as_array().ok())
    else {
        return out;
    };

    let mut code: u32 = 0;
    for item in diffs {
        match item {
            Object::Integer(n) => code = (*n).clamp(0, 255) as u32,
            Object::Name(name) => {
                if code <= 255 {
                    if let Some(c) = glyph_name_to_char(&String::from_utf8_lossy(name)) {
                        out.insert(code as u8, c);
                    }
                }
                code += 1;
            }
            _ => {}
        }
    }
    out
}

/// A small subset of the Adobe glyph list; enough for the names that show up
/// in Differences arrays of ordinary documents.
fn glyph_name_to_char(name: &str) -> Option<char> {
    if let Some(hex) = name.strip_prefix("uni") {
        if hex.len() == 4 {
            return u32::from_str_radix(hex, 16).ok().and_then(char::from_u32);
        }
    }
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return Some(c);
    }
    let c = match name {
        "space" => ' ',
        "exclam" => '!',
        "quotedbl" => '"',
        "numbersign" => '#',
        "dollar" => '$',
        "percent" => '%',
        "ampersand" => '&',
        "quotesingle" => '\'',
        "parenleft" => '(',
        "parenright" => ')',
        "asterisk" => '*',
        "plus" => '+',
        "comma" => ',',
        "hyphen" | "minus" => '-',
        "period" => '.',
        "slash" => '/',
        "zero" => '0',
        "one" => '1',
        "two" => '2',
        "three" => '3',
        "four" => '4',
        "five" => '5',
        "six" => '6',
        "seven" => '7',
        "eight" => '8',
        "nine" => '9',
        "colon" => ':',
        "semicolon" => ';',
        "less" => '<',
        "equal" => '=',
        "greater" => '>',
        "question" => '?',
        "at" => '@',
        "bracketleft" => '[',
        "backslash" => '\\',
        "bracketright" => ']',
        "underscore" => '_',
        "quoteleft" => '\u{2018}',
        "quoteright" => '\u{2019}',
        "quotedblleft" => '\u{201C}',
        "quotedblright" => '\u{201D}',
        "endash" => '\u{2013}',
        "emdash" => '\u{2014}',
        "bullet" => '\u{2022}',
        "fi" => '\u{FB01}',
        "fl" => '\u{FB02}',
        "Euro" => '€',
        _ => return None,
    };
    Some(c)
}

pub(crate) fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        other => other,
    }
}

pub(crate) fn number(doc: &Document, obj: &Object) -> Option<f64> {
    match resolve(doc, obj) {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(f) => Some(*f as f64),
        _ => None,
    }
}

pub(crate) fn name_of(obj: Option<&Object>) -> Option<String> {
    match obj {
        Some(Object::Name(name)) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

fn stream_bytes(doc: &Document, obj: &Object) -> Option<Vec<u8>> {
    let stream = resolve(doc, obj).as_stream().ok()?;
    if stream.dict.get(b"Filter").is_ok() {
        stream.decompressed_content().ok()
    } else {
        Some(stream.content.clone())
    }
}
