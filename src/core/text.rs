// logtail - core/text.rs
//
// Line-boundary scanning and per-line level detection.
//
// `LineSplitter` is fed decoded text chunk by chunk and yields complete
// lines. It recognises `\n`, `\r\n` and a lone `\r`, including a `\r\n`
// pair split across two chunks. Whatever follows the last terminator is
// kept as the partial (unterminated) line.

use crate::core::model::Level;
use crate::util::constants::{MAX_LINE_CHARS, TRUNCATION_MARKER};
use regex::Regex;
use std::sync::OnceLock;

/// Incremental line splitter.
#[derive(Debug, Clone, Default)]
pub struct LineSplitter {
    partial: String,
    /// The previous chunk ended with `\r`; a leading `\n` belongs to it.
    last_was_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The text after the last line terminator seen so far.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    pub fn clear(&mut self) {
        self.partial.clear();
        self.last_was_cr = false;
    }

    /// Feed `text` and return every line it completes, without terminators.
    pub fn push(&mut self, mut text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        if self.last_was_cr && !text.is_empty() {
            self.last_was_cr = false;
            if let Some(rest) = text.strip_prefix('\n') {
                text = rest;
            }
        }
        while let Some(pos) = text.find(['\r', '\n']) {
            self.partial.push_str(&text[..pos]);
            lines.push(std::mem::take(&mut self.partial));
            let terminator = text.as_bytes()[pos];
            text = &text[pos + 1..];
            if terminator == b'\r' {
                match text.strip_prefix('\n') {
                    Some(rest) => text = rest,
                    None if text.is_empty() => self.last_was_cr = true,
                    None => {}
                }
            }
        }
        self.partial.push_str(text);
        lines
    }
}

/// Cut `line` to at most `MAX_LINE_CHARS` chars, marking the cut.
pub fn truncate_line(line: String) -> String {
    match line.char_indices().nth(MAX_LINE_CHARS) {
        Some((idx, _)) => {
            let mut cut = line;
            cut.truncate(idx);
            cut.push_str(TRUNCATION_MARKER);
            cut
        }
        None => line,
    }
}

/// Detect the level of a line from the first level keyword it contains.
///
/// Keywords must stand alone (word boundaries) and be upper-case or
/// capitalised, so "error" inside ordinary prose is not mistaken for a
/// level.
pub fn detect_level(line: &str) -> Level {
    static LEVEL_RE: OnceLock<Regex> = OnceLock::new();
    let re = LEVEL_RE.get_or_init(|| {
        Regex::new(
            r"\b(FATAL|Fatal|CRITICAL|Critical|CRIT|ERROR|Error|ERR|WARNING|Warning|WARN|Warn|INFO|Info|INFORMATION|DEBUG|Debug|DBG|TRACE|Trace|VERBOSE|Verbose)\b",
        )
        .expect("detect_level: invalid regex")
    });
    re.captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| match m.as_str() {
            "VERBOSE" | "Verbose" => Some(Level::Trace),
            other => Level::from_name(other),
        })
        .unwrap_or(Level::Other)
}
