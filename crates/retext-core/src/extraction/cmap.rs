//! ToUnicode CMap parsing
//!
//! Only the parts needed for text extraction are understood: `bfchar` and
//! `bfrange` mappings. Codespace ranges are ignored; the code width comes
//! from the font type.

use std::collections::HashMap;

/// Code to Unicode mapping from a ToUnicode stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToUnicodeMap {
    map: HashMap<u32, String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Hex(Vec<u8>),
    Keyword(String),
    ArrayStart,
    ArrayEnd,
}

impl ToUnicodeMap {
    pub fn parse(data: &[u8]) -> Self {
        let tokens = tokenize(data);
        let mut map = HashMap::new();
        let mut i = 0;

        while i < tokens.len() {
            match &tokens[i] {
                Token::Keyword(k) if k == "beginbfchar" => {
                    i += 1;
                    while i + 1 < tokens.len() {
                        match (&tokens[i], &tokens[i + 1]) {
                            (Token::Hex(src), Token::Hex(dst)) => {
                                map.insert(code_of(src), utf16_be(dst));
                                i += 2;
                            }
                            _ => break,
                        }
                    }
                }
                Token::Keyword(k) if k == "beginbfrange" => {
                    i += 1;
                    while i + 2 < tokens.len() {
                        let (lo, hi) = match (&tokens[i], &tokens[i + 1]) {
                            (Token::Hex(lo), Token::Hex(hi)) => (code_of(lo), code_of(hi)),
                            _ => break,
                        };
                        match &tokens[i + 2] {
                            Token::Hex(dst) => {
                                insert_incrementing(&mut map, lo, hi, dst);
                                i += 3;
                            }
                            Token::ArrayStart => {
                                i += 3;
                                let mut code = lo;
                                while i < tokens.len() && tokens[i] != Token::ArrayEnd {
                                    if let Token::Hex(dst) = &tokens[i] {
                                        if code <= hi {
                                            map.insert(code, utf16_be(dst));
                                        }
                                        code = code.saturating_add(1);
                                    }
                                    i += 1;
                                }
                                i += 1;
                            }
                            _ => break,
                        }
                    }
                }
                _ => i += 1,
            }
        }

        Self { map }
    }

    pub fn get(&self, code: u32) -> Option<&str> {
        self.map.get(&code).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn insert_incrementing(map: &mut HashMap<u32, String>, lo: u32, hi: u32, dst: &[u8]) {
    // Guard against absurd ranges in broken files
    if hi < lo || hi - lo > 0xFFFF {
        return;
    }
    let base: Vec<u16> = dst
        .chunks(2)
        .map(|c| match c {
            [a, b] => u16::from_be_bytes([*a, *b]),
            [a] => *a as u16,
            _ => 0,
        })
        .collect();
    for (offset, code) in (lo..=hi).enumerate() {
        let mut units = base.clone();
        if let Some(last) = units.last_mut() {
            *last = last.wrapping_add(offset as u16);
        }
        map.insert(code, String::from_utf16_lossy(&units));
    }
}

fn code_of(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

fn utf16_be(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks(2)
        .map(|c| match c {
            [a, b] => u16::from_be_bytes([*a, *b]),
            [a] => *a as u16,
            _ => 0,
        })
        .collect();
    String::from_utf16_lossy(&units)
}

fn tokenize(data: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        match b {
            b'%' => {
                while i < data.len() && data[i] != b'\n' && data[i] != b'\r' {
                    i += 1;
                }
            }
            b'<' if data.get(i + 1) == Some(&b'<') => i += 2,
            b'>' if data.get(i + 1) == Some(&b'>') => i += 2,
            b'<' => {
                i += 1;
                let mut digits = Vec::new();
                while i < data.len() && data[i] != b'>' {
                    if data[i].is_ascii_hexdigit() {
                        digits.push(data[i]);
                    }
                    i += 1;
                }
                i += 1;
                if digits.len() % 2 == 1 {
                    digits.push(b'0');
                }
                let bytes = digits
                    .chunks(2)
                    .map(|pair| (hex_val(pair[0]) << 4) | hex_val(pair[1]))
                    .collect();
                tokens.push(Token::Hex(bytes));
            }
            b'[' => {
                tokens.push(Token::ArrayStart);
                i += 1;
            }
            b']' => {
                tokens.push(Token::ArrayEnd);
                i += 1;
            }
            b'(' => {
                // Literal strings only appear in CMap headers
                let mut depth = 0;
                while i < data.len() {
                    match data[i] {
                        b'\\' => i += 1,
                        b'(' => depth += 1,
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                i += 1;
                                break;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ if b.is_ascii_whitespace() => i += 1,
            _ => {
                let start = i;
                while i < data.len()
                    && !data[i].is_ascii_whitespace()
                    && !matches!(data[i], b'<' | b'>' | b'[' | b']' | b'(' | b'%')
                {
                    i += 1;
                }
                if i == start {
                    i += 1;
                    continue;
                }
                tokens.push(Token::Keyword(
                    String::from_utf8_lossy(&data[start..i]).into_owned(),
                ));
            }
        }
    }
    tokens
}

fn hex_val(d: u8) -> u8 {
    match d {
        b'0'..=b'9' => d - b'0',
        b'a'..=b'f' => d - b'a' + 10,
        b'A'..=b'F' => d - b'A' + 10,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &[u8] = br#"/CIDInit /ProcSet findresource begin
12 dict begin
begincmap
/CMapName /Adobe-Identity-UCS def
1 begincodespacerange
<0000> <FFFF>
endcodespacerange
2 beginbfchar
<0003> <0020>
<0011> <0032>
endbfchar
2 beginbfrange
<0024> <0026> <0041>
<0050> <0051> [<0444> <FB01>]
endbfrange
endcmap
CMapName currentdict /CMap defineresource pop
end
end"#;

    #[test]
    fn test_bfchar() {
        let map = ToUnicodeMap::parse(SAMPLE);
        assert_eq!(map.get(0x0003), Some(" "));
        assert_eq!(map.get(0x0011), Some("2"));
    }

    #[test]
    fn test_bfrange_incrementing() {
        let map = ToUnicodeMap::parse(SAMPLE);
        assert_eq!(map.get(0x0024), Some("A"));
        assert_eq!(map.get(0x0025), Some("B"));
        assert_eq!(map.get(0x0026), Some("C"));
        assert_eq!(map.get(0x0027), None);
    }

    #[test]
    fn test_bfrange_array_and_ligature() {
        let map = ToUnicodeMap::parse(SAMPLE);
        assert_eq!(map.get(0x0050), Some("ф"));
        assert_eq!(map.get(0x0051), Some("\u{FB01}"));
    }

    #[test]
    fn test_multi_char_destination() {
        let map = ToUnicodeMap::parse(b"1 beginbfchar <01> <00660069> endbfchar");
        assert_eq!(map.get(1), Some("fi"));
    }

    #[test]
    fn test_garbage_yields_empty_map() {
        assert!(ToUnicodeMap::parse(b"not a cmap at all").is_empty());
    }
}
