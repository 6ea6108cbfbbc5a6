// logtail - core/timestamp.rs
//
// Per-line timestamp extraction.
//
// Two modes:
//   - sniffing: search the line for the first recognisable timestamp among
//     common log formats, most precise first;
//   - custom: parse the start of the line with a configured chrono format.
//
// Never fails the caller: an unparseable timestamp is reported as a
// ParseError that the text source logs and recovers from.

use crate::util::error::ParseError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// How a text source finds the timestamp of each line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// Best-effort search for common formats anywhere in the line.
    #[default]
    Sniff,
    /// A chrono format string matched against the start of the line.
    Custom(String),
}

impl TimestampFormat {
    pub fn from_config(format: Option<&str>) -> Self {
        match format.map(str::trim) {
            Some(f) if !f.is_empty() => TimestampFormat::Custom(f.to_string()),
            _ => TimestampFormat::Sniff,
        }
    }

    /// Extract the timestamp of `line`.
    ///
    /// `Ok(None)` means the line carries no timestamp (sniffing found
    /// nothing). An `Err` means a custom format did not match.
    pub fn parse(
        &self,
        line: &str,
        line_number: usize,
    ) -> Result<Option<DateTime<Utc>>, ParseError> {
        match self {
            TimestampFormat::Sniff => Ok(sniff_timestamp(line)),
            TimestampFormat::Custom(format) => parse_prefix(line, format)
                .map(Some)
                .ok_or_else(|| ParseError::TimestampParse {
                    line_number,
                    raw_timestamp: crate::util::logging::preview(line).to_string(),
                    format: format.clone(),
                }),
        }
    }
}

/// Parse the start of `line` with a chrono `format`, ignoring whatever
/// follows the timestamp.
fn parse_prefix(line: &str, format: &str) -> Option<DateTime<Utc>> {
    let trimmed = line.trim_start();

    if let Ok((dt, _)) = DateTime::parse_and_remainder(trimmed, format) {
        return Some(dt.into());
    }
    if let Ok((ndt, _)) = NaiveDateTime::parse_and_remainder(trimmed, format) {
        return Some(ndt.and_utc());
    }
    if let Ok((nd, _)) = NaiveDate::parse_and_remainder(trimmed, format) {
        return nd.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
    }

    // Year-less formats (BSD syslog): assume the current year.
    if !format.contains("%Y") && !format.contains("%y") && !format.contains("%C") {
        let with_year = format!("{} {trimmed}", Utc::now().year());
        let year_format = format!("%Y {format}");
        if let Ok((ndt, _)) = NaiveDateTime::parse_and_remainder(&with_year, &year_format) {
            return Some(ndt.and_utc());
        }
    }
    None
}

/// Find and parse the first recognisable timestamp anywhere in `line`.
///
/// Patterns are tried from most precise (RFC 3339 with zone) to least
/// precise (year-less syslog), so a high-confidence match wins over a
/// looser one on the same line.
pub fn sniff_timestamp(line: &str) -> Option<DateTime<Utc>> {
    struct Sniffer {
        re: Regex,
        parse: fn(&str) -> Option<DateTime<Utc>>,
    }

    static SNIFFERS: OnceLock<Vec<Sniffer>> = OnceLock::new();

    let sniffers = SNIFFERS.get_or_init(|| {
        // Patterns are covered by the unit tests below.
        fn re(pat: &str) -> Regex {
            Regex::new(pat).expect("sniff_timestamp: invalid regex")
        }

        fn naive(s: &str, formats: &[&str]) -> Option<DateTime<Utc>> {
            formats
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
                .map(|ndt| ndt.and_utc())
        }

        vec![
            // 2024-01-15T14:30:22.123+05:30, 2024-01-15T14:30:22Z
            Sniffer {
                re: re(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})"),
                parse: |s| {
                    let s = s.replace(',', ".");
                    DateTime::parse_from_rfc3339(&s)
                        .or_else(|_| DateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f%z"))
                        .ok()
                        .map(|dt| dt.into())
                },
            },
            // 2024-01-15 14:30:22,123 (log4j)
            Sniffer {
                re: re(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2},\d+"),
                parse: |s| naive(&s.replace(',', ".").replace('T', " "), &["%Y-%m-%d %H:%M:%S%.f"]),
            },
            // 2024-01-15 14:30:22[.123]
            Sniffer {
                re: re(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?"),
                parse: |s| naive(&s.replace('T', " "), &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]),
            },
            // 2024/01/15 14:30:22[.123]
            Sniffer {
                re: re(r"\d{4}/\d{2}/\d{2}[ T]\d{2}:\d{2}:\d{2}(?:\.\d+)?"),
                parse: |s| {
                    naive(
                        &s.replace('/', "-").replace('T', " "),
                        &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"],
                    )
                },
            },
            // 26.02.2026 22:07:56[.535]
            Sniffer {
                re: re(r"\d{2}\.\d{2}\.\d{4} \d{2}:\d{2}:\d{2}(?:\.\d+)?"),
                parse: |s| naive(s, &["%d.%m.%Y %H:%M:%S%.f", "%d.%m.%Y %H:%M:%S"]),
            },
            // 15/Jan/2024:14:30:22 +0000 (Apache combined)
            Sniffer {
                re: re(r"\d{2}/[A-Za-z]{3}/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4}"),
                parse: |s| {
                    DateTime::parse_from_str(s, "%d/%b/%Y:%H:%M:%S %z")
                        .ok()
                        .map(|dt| dt.into())
                },
            },
            // Jan 15 2024 14:30:22, January 15, 2024 14:30:22
            Sniffer {
                re: re(r"[A-Z][a-z]{2,8} \d{1,2},? \d{4} \d{2}:\d{2}:\d{2}"),
                parse: |s| {
                    let s = s.replace(',', " ");
                    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
                    naive(&s, &["%b %d %Y %H:%M:%S", "%B %d %Y %H:%M:%S"])
                },
            },
            // Jan 15 14:30:22 (BSD syslog, year assumed current)
            Sniffer {
                re: re(r"[A-Z][a-z]{2} [ \d]\d \d{2}:\d{2}:\d{2}"),
                parse: |s| naive(&format!("{} {s}", Utc::now().year()), &["%Y %b %e %H:%M:%S"]),
            },
            // 20240115T143022
            Sniffer {
                re: re(r"\d{8}[T ]\d{6}"),
                parse: |s| naive(&s.replace(' ', "T"), &["%Y%m%dT%H%M%S"]),
            },
        ]
    });

    sniffers.iter().find_map(|sniffer| {
        sniffer
            .re
            .find(line)
            .and_then(|m| (sniffer.parse)(m.as_str()))
    })
}

/// Signed time from `from` to `to`; `None` unless both are known.
pub fn span(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Option<Duration> {
    from.zip(to).map(|(from, to)| to - from)
}
