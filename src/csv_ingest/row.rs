//! Raw row handling: byte decoding, delimiter detection, field parsing.

/// Fixed shape for one parsed CSV data row. Unknown columns never land
/// here; they are warned about upstream and dropped.
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    pub email: String,
    pub name: Option<String>,
    pub organization: Option<String>,
    pub tags: Option<String>,
    pub subscribed: Option<String>,
}

/// Decode uploaded bytes into text. UTF-16 is recognized by BOM, UTF-8
/// with or without BOM, and anything that fails UTF-8 falls back to
/// ISO-8859-1 (every byte maps to a char, so this cannot fail).
pub fn decode_bytes(bytes: &[u8]) -> (String, &'static str) {
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        return (decode_utf16(&bytes[2..], true), "utf-16le");
    }
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        return (decode_utf16(&bytes[2..], false), "utf-16be");
    }

    let without_bom = if bytes.len() >= 3 && bytes[..3] == [0xEF, 0xBB, 0xBF] {
        &bytes[3..]
    } else {
        bytes
    };

    match std::str::from_utf8(without_bom) {
        Ok(text) => (text.to_string(), "utf-8"),
        Err(_) => (
            without_bom.iter().map(|&b| b as char).collect(),
            "iso-8859-1",
        ),
    }
}

fn decode_utf16(bytes: &[u8], little_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// Pick the delimiter whose count in the header line is highest.
/// Comma wins ties, and an undelimited header falls back to comma.
pub fn detect_delimiter(header_line: &str) -> char {
    let candidates = [',', ';', '\t', '|'];
    let mut best = ',';
    let mut best_count = 0usize;
    for candidate in candidates {
        let count = header_line.matches(candidate).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

/// Split one line on the delimiter, honoring double-quoted fields with
/// doubled-quote escapes.
pub fn split_line(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(ch);
            }
        } else if ch == '"' && current.is_empty() {
            in_quotes = true;
        } else if ch == delimiter {
            fields.push(current.trim().to_string());
            current = String::new();
        } else {
            current.push(ch);
        }
    }
    fields.push(current.trim().to_string());
    fields
}

/// Tags accept comma, semicolon, or pipe separation. The first separator
/// that appears in the raw value decides the split. Each tag is trimmed
/// and capped in length, and the list itself is capped.
pub fn parse_tags(raw: &str, max_tags: usize, max_tag_length: usize) -> Vec<String> {
    let separator = raw.chars().find(|c| matches!(c, ',' | ';' | '|'));

    let parts: Vec<&str> = match separator {
        Some(sep) => raw.split(sep).collect(),
        None => vec![raw],
    };

    parts
        .into_iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| t.chars().take(max_tag_length).collect::<String>())
        .take(max_tags)
        .collect()
}

/// Lenient boolean parsing for the subscribed column. `None` means the
/// value was present but unrecognized; callers warn and default to true.
pub fn parse_subscribed(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
