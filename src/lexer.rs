//! Line and field splitting over raw trace bytes
//!
//! Everything here borrows from the loaded trace buffer; nothing is copied
//! until a field is decoded into a typed value.

use std::str;

/// Column separator within a trace line
pub const FIELD_SEPARATOR: u8 = b',';

/// One line of the trace, without its line ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceLine<'a> {
    /// 1-based line number in the file
    pub number: usize,
    pub bytes: &'a [u8],
}

impl<'a> TraceLine<'a> {
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(|b| b.is_ascii_whitespace())
    }

    /// Whether the line is exactly `text`
    pub fn matches(&self, text: &str) -> bool {
        self.bytes == text.as_bytes()
    }

    /// Lossy text rendering for diagnostics
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.bytes).into_owned()
    }
}

/// Lazy splitter producing [`TraceLine`]s from a byte buffer
#[derive(Debug, Clone)]
pub struct LineSplit<'a> {
    data: &'a [u8],
    pos: usize,
    line_number: usize,
}

impl<'a> LineSplit<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            line_number: 0,
        }
    }

    /// Produce the next line, or `None` once the buffer is exhausted
    pub fn next_line(&mut self) -> Option<TraceLine<'a>> {
        if self.pos >= self.data.len() {
            return None;
        }

        let rest = &self.data[self.pos..];
        let (line, consumed) = match rest.iter().position(|&b| b == b'\n') {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        self.line_number += 1;

        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Some(TraceLine {
            number: self.line_number,
            bytes: line,
        })
    }

    /// Look at the next line without consuming it
    pub fn peek_line(&self) -> Option<TraceLine<'a>> {
        self.clone().next_line()
    }

    /// Number of the most recently produced line (0 before the first)
    pub fn line_number(&self) -> usize {
        self.line_number
    }
}

impl<'a> Iterator for LineSplit<'a> {
    type Item = TraceLine<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line()
    }
}

/// A single column of a trace line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a>(pub &'a [u8]);

impl<'a> Field<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        self.0
    }

    pub fn as_str(&self) -> Option<&'a str> {
        str::from_utf8(self.0).ok()
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_str()?.trim().parse().ok()
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_str()?.trim().parse().ok()
    }

    pub fn as_usize(&self) -> Option<usize> {
        self.as_str()?.trim().parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_str()?.trim().parse().ok()
    }

    /// Booleans are recorded as `0` or `1`
    pub fn as_bool(&self) -> Option<bool> {
        match self.0 {
            b"0" => Some(false),
            b"1" => Some(true),
            _ => None,
        }
    }

    /// Hexadecimal pointer value. `(nil)` and an empty field are zero.
    pub fn as_pointer(&self) -> Option<u64> {
        parse_pointer(self.as_str()?)
    }

    /// Space-separated hexadecimal pointers; an empty field is an empty list
    pub fn as_pointer_list(&self) -> Option<Vec<u64>> {
        self.as_str()?.split_ascii_whitespace().map(parse_pointer).collect()
    }
}

fn parse_pointer(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() || text == "(nil)" {
        return Some(0);
    }
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Ordered fields of one line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldList<'a> {
    fields: Vec<Field<'a>>,
}

impl<'a> FieldList<'a> {
    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Field<'a>> {
        self.fields.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Field<'a>> + '_ {
        self.fields.iter().copied()
    }

    pub fn u32_at(&self, index: usize) -> Option<u32> {
        self.get(index)?.as_u32()
    }

    pub fn u64_at(&self, index: usize) -> Option<u64> {
        self.get(index)?.as_u64()
    }

    pub fn bool_at(&self, index: usize) -> Option<bool> {
        self.get(index)?.as_bool()
    }

    pub fn pointer_at(&self, index: usize) -> Option<u64> {
        self.get(index)?.as_pointer()
    }

    pub fn pointer_list_at(&self, index: usize) -> Option<Vec<u64>> {
        self.get(index)?.as_pointer_list()
    }

    pub fn str_at(&self, index: usize) -> Option<&'a str> {
        self.get(index)?.as_str()
    }

    /// Trailing optional text column: absent or empty means `None`.
    /// The outer `None` signals undecodable bytes.
    pub fn optional_str_at(&self, index: usize) -> Option<Option<&'a str>> {
        match self.get(index) {
            None => Some(None),
            Some(field) => {
                let text = field.as_str()?;
                Some(if text.is_empty() { None } else { Some(text) })
            }
        }
    }
}

/// Split `line` on [`FIELD_SEPARATOR`] into at most `max_count` fields.
///
/// The last field keeps any remaining separators verbatim, so free-text
/// trailing columns survive intact. `max_count == 0` yields no fields.
pub fn split_fields(line: &[u8], max_count: usize) -> FieldList<'_> {
    let mut fields = Vec::with_capacity(max_count.min(32));
    if max_count == 0 {
        return FieldList { fields };
    }

    let mut rest = line;
    while fields.len() + 1 < max_count {
        match rest.iter().position(|&b| b == FIELD_SEPARATOR) {
            Some(at) => {
                fields.push(Field(&rest[..at]));
                rest = &rest[at + 1..];
            }
            None => break,
        }
    }
    fields.push(Field(rest));

    FieldList { fields }
}
