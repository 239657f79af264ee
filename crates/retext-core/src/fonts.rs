//! Standard 14 font mapping, built-in glyph metrics and WinAnsi encoding
//!
//! Replacement text is always drawn with one of the PDF standard fonts, so we
//! only need metrics for those. Embedded fonts are never re-used for drawing.

/// Map an arbitrary base font name to one of the standard 14 fonts.
///
/// Handles subset-prefixed names ("BCDEEE+ArialMT"), PostScript names with
/// style suffixes ("TimesNewRomanPS-BoldMT") and CSS generic families.
pub fn map_to_standard_font(name: &str) -> &'static str {
    let lower = strip_subset_prefix(name).to_lowercase();

    match lower.as_str() {
        "serif" => return "Times-Roman",
        "sans-serif" => return "Helvetica",
        "monospace" => return "Courier",
        "cursive" | "fantasy" => return "Helvetica",
        _ => {}
    }

    let bold = lower.contains("bold") || lower.contains("black") || lower.contains("heavy");
    let italic = lower.contains("italic") || lower.contains("oblique");

    if lower.contains("courier")
        || lower.contains("mono")
        || lower.contains("consolas")
        || lower.contains("monaco")
    {
        return match (bold, italic) {
            (true, true) => "Courier-BoldOblique",
            (true, false) => "Courier-Bold",
            (false, true) => "Courier-Oblique",
            (false, false) => "Courier",
        };
    }

    if lower.contains("times")
        || lower.contains("georgia")
        || lower.contains("garamond")
        || lower.contains("cambria")
        || (lower.contains("serif") && !lower.contains("sans"))
    {
        return match (bold, italic) {
            (true, true) => "Times-BoldItalic",
            (true, false) => "Times-Bold",
            (false, true) => "Times-Italic",
            (false, false) => "Times-Roman",
        };
    }

    if lower.contains("symbol") {
        return "Symbol";
    }
    if lower.contains("zapf") || lower.contains("dingbat") {
        return "ZapfDingbats";
    }

    // Arial, Helvetica, Calibri and everything else
    match (bold, italic) {
        (true, true) => "Helvetica-BoldOblique",
        (true, false) => "Helvetica-Bold",
        (false, true) => "Helvetica-Oblique",
        (false, false) => "Helvetica",
    }
}

/// "ABCDEF+Name" -> "Name"
pub fn strip_subset_prefix(name: &str) -> &str {
    match name.split_once('+') {
        Some((prefix, rest))
            if prefix.len() == 6 && prefix.chars().all(|c| c.is_ascii_uppercase()) =>
        {
            rest
        }
        _ => name,
    }
}

// Advance widths for WinAnsi codes 32..=126, in 1/1000 em.
const HELVETICA: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // 32-47
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // 48-63
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // 64-79
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // 80-95
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // 96-111
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, // 112-126
];

const HELVETICA_BOLD: [u16; 95] = [
    278, 333, 474, 556, 556, 889, 722, 238, 333, 333, 389, 584, 278, 333, 278, 278, //
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 333, 333, 584, 584, 584, 611, //
    975, 722, 722, 722, 722, 667, 611, 778, 722, 278, 556, 722, 611, 833, 722, 778, //
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 333, 278, 333, 584, 556, //
    333, 556, 611, 556, 611, 556, 333, 611, 611, 278, 278, 556, 278, 889, 611, 611, //
    611, 611, 389, 556, 333, 611, 556, 778, 556, 556, 500, 389, 280, 389, 584,
];

const TIMES_ROMAN: [u16; 95] = [
    250, 333, 408, 500, 500, 833, 778, 180, 333, 333, 500, 564, 250, 333, 250, 278, //
    500, 500, 500, 500, 500, 500, 500, 500, 500, 500, 278, 278, 564, 564, 564, 444, //
    921, 722, 667, 667, 722, 611, 556, 722, 722, 333, 389, 722, 611, 889, 722, 722, //
    556, 722, 667, 556, 611, 722, 722, 944, 722, 722, 611, 333, 278, 333, 469, 500, //
    333, 444, 500, 444, 500, 444, 333, 500, 500, 278, 278, 500, 278, 778, 500, 500, //
    500, 500, 333, 389, 278, 500, 500, 722, 500, 500, 444, 480, 200, 480, 541,
];

const TIMES_BOLD: [u16; 95] = [
    250, 333, 555, 500, 500, 1000, 833, 278, 333, 333, 500, 570, 250, 333, 250, 278, //
    500, 500, 500, 500, 500, 500, 500, 500, 500, 500, 333, 333, 570, 570, 570, 500, //
    930, 722, 667, 722, 722, 667, 611, 778, 778, 389, 500, 778, 667, 944, 722, 778, //
    611, 778, 722, 556, 667, 722, 722, 1000, 722, 722, 667, 333, 278, 333, 581, 500, //
    333, 500, 556, 444, 556, 444, 333, 500, 556, 278, 333, 556, 278, 833, 556, 500, //
    556, 556, 444, 389, 333, 556, 500, 722, 500, 500, 444, 394, 220, 394, 520,
];

/// Width used for glyphs without any known metric, in 1/1000 em.
pub const FALLBACK_WIDTH: f64 = 500.0;

/// Which built-in table applies to a standard font, and whether it is the
/// font's own table or a stand-in from the same family.
fn metrics_table(standard_name: &str) -> Option<(&'static [u16; 95], bool)> {
    match standard_name {
        "Helvetica" | "Helvetica-Oblique" => Some((&HELVETICA, true)),
        "Helvetica-Bold" | "Helvetica-BoldOblique" => Some((&HELVETICA_BOLD, true)),
        "Times-Roman" => Some((&TIMES_ROMAN, true)),
        "Times-Bold" => Some((&TIMES_BOLD, true)),
        "Times-Italic" => Some((&TIMES_ROMAN, false)),
        "Times-BoldItalic" => Some((&TIMES_BOLD, false)),
        _ => None,
    }
}

fn is_courier(standard_name: &str) -> bool {
    standard_name.starts_with("Courier")
}

/// Width of a WinAnsi code in a standard font, with an exactness flag.
///
/// Returns `None` when the font is not one we carry metrics for.
pub fn standard_width(standard_name: &str, code: u8) -> Option<(f64, bool)> {
    if is_courier(standard_name) {
        return Some((600.0, true));
    }
    let (table, exact) = metrics_table(standard_name)?;
    match code {
        32..=126 => Some((table[(code - 32) as usize] as f64, exact)),
        // Non-ASCII WinAnsi glyphs: approximate by the width of 'n'
        _ => Some((table[(b'n' - 32) as usize] as f64, false)),
    }
}

/// True when `base_font` names a font whose metrics we know exactly.
pub fn has_exact_standard_metrics(base_font: &str) -> bool {
    let stripped = strip_subset_prefix(base_font);
    let standard = map_to_standard_font(stripped);
    if stripped != standard {
        // "ArialMT" maps to Helvetica but its metrics are not ours to assume
        return false;
    }
    is_courier(standard) || metrics_table(standard).map(|(_, exact)| exact).unwrap_or(false)
}

/// Advance of `text` drawn in a standard font, in 1/1000 em.
///
/// Characters outside WinAnsi count as `?`, which is what gets drawn.
pub fn text_width_units(standard_name: &str, text: &str) -> f64 {
    text.chars()
        .map(|c| {
            let code = encode_win_ansi(c).unwrap_or(b'?');
            standard_width(standard_name, code)
                .map(|(w, _)| w)
                .unwrap_or(FALLBACK_WIDTH)
        })
        .sum()
}

// WinAnsi 0x80..=0x9F; zero marks an undefined code.
const WIN_ANSI_HIGH: [u16; 32] = [
    0x20AC, 0, 0x201A, 0x0192, 0x201E, 0x2026, 0x2020, 0x2021, 0x02C6, 0x2030, 0x0160, 0x2039,
    0x0152, 0, 0x017D, 0, 0, 0x2018, 0x2019, 0x201C, 0x201D, 0x2022, 0x2013, 0x2014, 0x02DC,
    0x2122, 0x0161, 0x203A, 0x0153, 0, 0x017E, 0x0178,
];

/// Decode a single-byte WinAnsi code. Undefined codes map to U+FFFD.
pub fn decode_win_ansi(code: u8) -> char {
    match code {
        0x80..=0x9F => {
            let cp = WIN_ANSI_HIGH[(code - 0x80) as usize];
            if cp == 0 {
                char::REPLACEMENT_CHARACTER
            } else {
                char::from_u32(cp as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
            }
        }
        _ => code as char,
    }
}

/// Encode a character into WinAnsi, if representable.
pub fn encode_win_ansi(c: char) -> Option<u8> {
    let cp = c as u32;
    match cp {
        0x20..=0x7E | 0xA0..=0xFF => Some(cp as u8),
        _ => WIN_ANSI_HIGH
            .iter()
            .position(|&h| h != 0 && h as u32 == cp)
            .map(|i| 0x80 + i as u8),
    }
}

/// Encode `text` for a WinAnsi standard font. Unrepresentable characters
/// become `?`; the second value lists them.
pub fn encode_win_ansi_lossy(text: &str) -> (Vec<u8>, Vec<char>) {
    let mut bytes = Vec::with_capacity(text.len());
    let mut missing = Vec::new();
    for c in text.chars() {
        match encode_win_ansi(c) {
            Some(b) => bytes.push(b),
            None => {
                bytes.push(b'?');
                if !missing.contains(&c) {
                    missing.push(c);
                }
            }
        }
    }
    (bytes, missing)
}
