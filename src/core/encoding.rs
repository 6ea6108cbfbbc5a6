// logtail - core/encoding.rs
//
// Text encoding detection and incremental decoding.
//
// A file's encoding is chosen once, from its byte-order mark, falling back
// to a configured default. Decoding is incremental: bytes that end in the
// middle of a code unit or sequence are held back until the next chunk
// arrives. Invalid sequences decode to U+FFFD.

use crate::util::error::ParseError;

const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// Supported text encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
    Latin1,
}

/// Byte-order marks, longest first so UTF-32LE wins over UTF-16LE.
const BOMS: &[(&[u8], Encoding)] = &[
    (&[0xFF, 0xFE, 0x00, 0x00], Encoding::Utf32Le),
    (&[0x00, 0x00, 0xFE, 0xFF], Encoding::Utf32Be),
    (&[0xEF, 0xBB, 0xBF], Encoding::Utf8),
    (&[0xFF, 0xFE], Encoding::Utf16Le),
    (&[0xFE, 0xFF], Encoding::Utf16Be),
];

impl Encoding {
    /// Canonical lowercase name, as shown in the `encoding` property.
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Utf16Le => "utf-16le",
            Encoding::Utf16Be => "utf-16be",
            Encoding::Utf32Le => "utf-32le",
            Encoding::Utf32Be => "utf-32be",
            Encoding::Latin1 => "latin1",
        }
    }

    /// Parse an encoding name (case-insensitive, common aliases accepted).
    pub fn from_name(name: &str) -> Option<Encoding> {
        match name.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Encoding::Utf8),
            "utf-16" | "utf-16le" | "utf16le" | "unicode" => Some(Encoding::Utf16Le),
            "utf-16be" | "utf16be" | "bigendianunicode" => Some(Encoding::Utf16Be),
            "utf-32" | "utf-32le" | "utf32le" => Some(Encoding::Utf32Le),
            "utf-32be" | "utf32be" => Some(Encoding::Utf32Be),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Some(Encoding::Latin1),
            _ => None,
        }
    }

    /// Whether this encoding may be configured as the no-BOM fallback.
    /// UTF-32 is only ever selected by its byte-order mark.
    pub fn is_valid_fallback(&self) -> bool {
        !matches!(self, Encoding::Utf32Le | Encoding::Utf32Be)
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of inspecting the first bytes of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BomDetection {
    /// A byte-order mark of `len` bytes selects `encoding`.
    Found { encoding: Encoding, len: usize },
    /// The bytes cannot start with any byte-order mark.
    Absent,
    /// Too few bytes to decide; the prefix matches the start of a mark.
    NeedMoreData,
}

/// Inspect the start of a file for a byte-order mark.
///
/// `at_end` is true when `prefix` already holds every byte of the file;
/// a short prefix is then decided instead of waiting for more data.
pub fn detect_bom(prefix: &[u8], at_end: bool) -> BomDetection {
    let mut undecided = false;
    for (bom, encoding) in BOMS {
        if prefix.starts_with(bom) {
            if undecided {
                // A longer mark could still match once more bytes arrive.
                return BomDetection::NeedMoreData;
            }
            return BomDetection::Found {
                encoding: *encoding,
                len: bom.len(),
            };
        }
        if !at_end && prefix.len() < bom.len() && bom.starts_with(prefix) {
            undecided = true;
        }
    }
    if undecided {
        BomDetection::NeedMoreData
    } else {
        BomDetection::Absent
    }
}

/// Incremental decoder for one encoding.
#[derive(Debug, Clone)]
pub struct Decoder {
    encoding: Encoding,
    /// Bytes of an incomplete trailing sequence from the previous chunk.
    pending: Vec<u8>,
    /// Byte offset (relative to the first decoded byte) of `pending[0]`.
    offset: u64,
    /// First invalid sequence seen since the last `take_error`.
    error: Option<ParseError>,
}

impl Decoder {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
            offset: 0,
            error: None,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Number of held-back bytes waiting for the rest of their sequence.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any held-back bytes and restart offsets at zero.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.offset = 0;
        self.error = None;
    }

    /// Take the first decode error recorded since the previous call.
    pub fn take_error(&mut self) -> Option<ParseError> {
        self.error.take()
    }

    /// Decode `bytes`, appending the text to `out`.
    pub fn decode_into(&mut self, bytes: &[u8], out: &mut String) {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);
        let consumed = match self.encoding {
            Encoding::Utf8 => self.decode_utf8(&buf, out),
            Encoding::Utf16Le => self.decode_utf16(&buf, out, u16::from_le_bytes),
            Encoding::Utf16Be => self.decode_utf16(&buf, out, u16::from_be_bytes),
            Encoding::Utf32Le => self.decode_utf32(&buf, out, u32::from_le_bytes),
            Encoding::Utf32Be => self.decode_utf32(&buf, out, u32::from_be_bytes),
            Encoding::Latin1 => {
                out.extend(buf.iter().map(|b| char::from(*b)));
                buf.len()
            }
        };
        self.pending = buf[consumed..].to_vec();
        self.offset += consumed as u64;
    }

    /// Decode `bytes` into a fresh string.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len());
        self.decode_into(bytes, &mut out);
        out
    }

    fn record_invalid(&mut self, at: usize) {
        if self.error.is_none() {
            self.error = Some(ParseError::Decode {
                encoding: self.encoding.name(),
                offset: self.offset + at as u64,
            });
        }
    }

    fn decode_utf8(&mut self, buf: &[u8], out: &mut String) -> usize {
        let mut pos = 0;
        while pos < buf.len() {
            match std::str::from_utf8(&buf[pos..]) {
                Ok(text) => {
                    out.push_str(text);
                    return buf.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&buf[pos..pos + valid]) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        Some(len) => {
                            self.record_invalid(pos + valid);
                            out.push(REPLACEMENT);
                            pos += valid + len;
                        }
                        // Incomplete sequence at the end: hold it back.
                        None => return pos + valid,
                    }
                }
            }
        }
        pos
    }

    fn decode_utf16(
        &mut self,
        buf: &[u8],
        out: &mut String,
        unit: fn([u8; 2]) -> u16,
    ) -> usize {
        let mut units: Vec<u16> = buf
            .chunks_exact(2)
            .map(|pair| unit([pair[0], pair[1]]))
            .collect();
        // A lone high surrogate at the end waits for its partner.
        if matches!(units.last(), Some(0xD800..=0xDBFF)) {
            units.pop();
        }
        let mut at = 0;
        for decoded in char::decode_utf16(units.iter().copied()) {
            match decoded {
                Ok(c) => {
                    out.push(c);
                    at += c.len_utf16() * 2;
                }
                Err(_) => {
                    self.record_invalid(at);
                    out.push(REPLACEMENT);
                    at += 2;
                }
            }
        }
        units.len() * 2
    }

    fn decode_utf32(
        &mut self,
        buf: &[u8],
        out: &mut String,
        unit: fn([u8; 4]) -> u32,
    ) -> usize {
        let chunks = buf.chunks_exact(4);
        let consumed = buf.len() - chunks.remainder().len();
        for (i, quad) in chunks.enumerate() {
            let value = unit([quad[0], quad[1], quad[2], quad[3]]);
            match char::from_u32(value) {
                Some(c) => out.push(c),
                None => {
                    self.record_invalid(i * 4);
                    out.push(REPLACEMENT);
                }
            }
        }
        consumed
    }
}
