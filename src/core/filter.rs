// logtail - core/filter.rs
//
// Filter predicates for log entries.
//
// `Predicate` is the tagged union the filter source evaluates; `FilterState`
// is the user-facing set of filters (all AND-combined) that builds one.
// Core layer: pure logic, no I/O.

use crate::core::expression::Expr;
use crate::core::model::{Level, LevelFlags, LogEntry};
use crate::util::constants::MAX_FILTER_PATTERN_LENGTH;
use crate::util::error::FilterError;
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use regex::Regex;

/// Wildcards match anywhere in the line, ignoring case.
const WILDCARD_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A test applied to each entry.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Case-insensitive substring; the needle is stored lower-cased.
    Substring(String),
    /// Shell-style wildcard (`*`, `?`, `[...]`) matched anywhere in the line.
    Wildcard(Pattern),
    Regex(Regex),
    Level(LevelFlags),
    /// Inclusive time range; entries without a timestamp never match.
    TimeRange {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    Expression(Expr),
    /// All must match. An empty `And` matches everything.
    And(Vec<Predicate>),
    /// Any must match. An empty `Or` matches nothing.
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

fn check_length(pattern: &str) -> Result<(), FilterError> {
    let length = pattern.chars().count();
    if length > MAX_FILTER_PATTERN_LENGTH {
        return Err(FilterError::PatternTooLong {
            length,
            max_length: MAX_FILTER_PATTERN_LENGTH,
        });
    }
    Ok(())
}

impl Predicate {
    /// A predicate that passes every entry.
    pub fn pass_all() -> Predicate {
        Predicate::And(Vec::new())
    }

    pub fn substring(text: &str) -> Result<Predicate, FilterError> {
        check_length(text)?;
        Ok(Predicate::Substring(text.to_lowercase()))
    }

    pub fn wildcard(pattern: &str) -> Result<Predicate, FilterError> {
        check_length(pattern)?;
        let anywhere = format!("*{}*", pattern.trim_matches('*'));
        Pattern::new(&anywhere)
            .map(Predicate::Wildcard)
            .map_err(|source| FilterError::InvalidWildcard {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn regex(pattern: &str) -> Result<Predicate, FilterError> {
        check_length(pattern)?;
        Regex::new(pattern)
            .map(Predicate::Regex)
            .map_err(|source| FilterError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn expression(source: &str) -> Result<Predicate, FilterError> {
        check_length(source)?;
        Expr::parse(source).map(Predicate::Expression)
    }

    /// True for the trivial predicate that passes everything.
    pub fn is_pass_all(&self) -> bool {
        matches!(self, Predicate::And(parts) if parts.is_empty())
    }

    /// Whether `entry` passes.
    pub fn matches(&self, entry: &LogEntry) -> bool {
        match self {
            Predicate::Substring(needle) => entry
                .raw_content()
                .is_some_and(|text| text.to_lowercase().contains(needle.as_str())),
            Predicate::Wildcard(pattern) => entry
                .raw_content()
                .is_some_and(|text| pattern.matches_with(text, WILDCARD_OPTIONS)),
            Predicate::Regex(regex) => entry.raw_content().is_some_and(|text| regex.is_match(text)),
            Predicate::Level(flags) => flags.contains(entry.level()),
            Predicate::TimeRange { start, end } => match entry.timestamp() {
                Some(ts) => {
                    start.map_or(true, |s| ts >= s) && end.map_or(true, |e| ts <= e)
                }
                None => false,
            },
            Predicate::Expression(expr) => expr.eval(entry),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(entry)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(entry)),
            Predicate::Not(inner) => !inner.matches(entry),
        }
    }

    /// Whether any line of a multi-line entry passes.
    pub fn matches_any<'a>(&self, lines: impl IntoIterator<Item = &'a LogEntry>) -> bool {
        lines.into_iter().any(|line| self.matches(line))
    }
}

/// Complete filter state. All fields are AND-combined when applied.
#[derive(Debug, Clone, Default)]
pub struct FilterState {
    /// Levels to include (empty = all).
    pub levels: LevelFlags,

    /// Start of time range (inclusive). None = no lower bound.
    pub time_start: Option<DateTime<Utc>>,

    /// End of time range (inclusive). None = no upper bound.
    pub time_end: Option<DateTime<Utc>>,

    /// Substring text search (case-insensitive). Empty = no filter.
    pub text_search: String,

    /// Compiled regex search. None = no regex filter.
    pub regex_search: Option<Regex>,

    /// Wildcard search. None = no wildcard filter.
    pub wildcard_search: Option<Pattern>,

    /// Parsed filter expression. None = no expression filter.
    pub expression: Option<Expr>,
}

impl FilterState {
    /// Returns true if no filters are active.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
            && self.time_start.is_none()
            && self.time_end.is_none()
            && self.text_search.is_empty()
            && self.regex_search.is_none()
            && self.wildcard_search.is_none()
            && self.expression.is_none()
    }

    /// Set the substring search.
    pub fn set_text(&mut self, text: &str) -> Result<(), FilterError> {
        check_length(text)?;
        self.text_search = text.to_string();
        Ok(())
    }

    /// Set the regex search pattern, compiling it.
    /// Returns an error if the pattern is invalid.
    pub fn set_regex(&mut self, pattern: &str) -> Result<(), FilterError> {
        if pattern.is_empty() {
            self.regex_search = None;
            return Ok(());
        }
        if let Predicate::Regex(regex) = Predicate::regex(pattern)? {
            self.regex_search = Some(regex);
        }
        Ok(())
    }

    pub fn set_wildcard(&mut self, pattern: &str) -> Result<(), FilterError> {
        if pattern.is_empty() {
            self.wildcard_search = None;
            return Ok(());
        }
        if let Predicate::Wildcard(p) = Predicate::wildcard(pattern)? {
            self.wildcard_search = Some(p);
        }
        Ok(())
    }

    pub fn set_expression(&mut self, source: &str) -> Result<(), FilterError> {
        if source.trim().is_empty() {
            self.expression = None;
            return Ok(());
        }
        check_length(source)?;
        self.expression = Some(Expr::parse(source)?);
        Ok(())
    }

    /// Include only `level` and above.
    pub fn set_minimum_level(&mut self, level: Level) {
        self.levels = LevelFlags::at_least(level);
    }

    /// Build the predicate equivalent to this state.
    pub fn to_predicate(&self) -> Predicate {
        let mut parts = Vec::new();
        if !self.levels.is_empty() {
            parts.push(Predicate::Level(self.levels));
        }
        if self.time_start.is_some() || self.time_end.is_some() {
            parts.push(Predicate::TimeRange {
                start: self.time_start,
                end: self.time_end,
            });
        }
        if !self.text_search.is_empty() {
            parts.push(Predicate::Substring(self.text_search.to_lowercase()));
        }
        if let Some(regex) = &self.regex_search {
            parts.push(Predicate::Regex(regex.clone()));
        }
        if let Some(pattern) = &self.wildcard_search {
            parts.push(Predicate::Wildcard(pattern.clone()));
        }
        if let Some(expr) = &self.expression {
            parts.push(Predicate::Expression(expr.clone()));
        }
        match parts.len() {
            1 => parts.remove(0),
            _ => Predicate::And(parts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::column::{columns, Value};
    use chrono::TimeZone;

    fn make_entry(level: Level, message: &str) -> LogEntry {
        let mut e = LogEntry::new();
        e.set(columns::LEVEL, Value::Level(level));
        e.set(columns::RAW_CONTENT, Value::Text(Some(message.to_string())));
        e
    }

    fn apply(entries: &[LogEntry], predicate: &Predicate) -> Vec<usize> {
        entries
            .iter()
            .enumerate()
            .filter(|(_, e)| predicate.matches(e))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_empty_filter_returns_all() {
        let entries = vec![
            make_entry(Level::Error, "Error 1"),
            make_entry(Level::Info, "Info 1"),
        ];
        let predicate = FilterState::default().to_predicate();
        assert!(predicate.is_pass_all());
        assert_eq!(apply(&entries, &predicate), vec![0, 1]);
    }

    #[test]
    fn test_level_filter() {
        let entries = vec![
            make_entry(Level::Error, "Error 1"),
            make_entry(Level::Info, "Info 1"),
            make_entry(Level::Warning, "Warning 1"),
        ];
        let mut filter = FilterState::default();
        filter.set_minimum_level(Level::Warning);
        assert_eq!(apply(&entries, &filter.to_predicate()), vec![0, 2]);
    }

    #[test]
    fn test_text_search_case_insensitive() {
        let entries = vec![
            make_entry(Level::Error, "Connection FAILED"),
            make_entry(Level::Info, "Connection succeeded"),
        ];
        let predicate = Predicate::substring("failed").unwrap();
        assert_eq!(apply(&entries, &predicate), vec![0]);
    }

    #[test]
    fn test_wildcard_matches_anywhere() {
        let entries = vec![
            make_entry(Level::Info, "user alice logged in from 10.0.0.1"),
            make_entry(Level::Info, "user bob logged out"),
        ];
        let predicate = Predicate::wildcard("LOGGED IN*10.?.0.1").unwrap();
        assert_eq!(apply(&entries, &predicate), vec![0]);
    }

    #[test]
    fn test_regex_filter() {
        let entries = vec![
            make_entry(Level::Error, "Error code: 404"),
            make_entry(Level::Error, "Error code: 500"),
            make_entry(Level::Info, "Status OK"),
        ];
        let mut filter = FilterState::default();
        filter.set_regex(r"code:\s*5\d{2}").unwrap();
        assert_eq!(apply(&entries, &filter.to_predicate()), vec![1]);
    }

    #[test]
    fn test_combined_filters() {
        let entries = vec![
            make_entry(Level::Error, "Database connection failed"),
            make_entry(Level::Error, "Network timeout"),
            make_entry(Level::Info, "Database query ok"),
        ];
        let mut filter = FilterState {
            levels: LevelFlags::ERROR,
            ..Default::default()
        };
        filter.set_text("database").unwrap();
        assert_eq!(apply(&entries, &filter.to_predicate()), vec![0]);
    }

    #[test]
    fn test_time_range_excludes_untimestamped() {
        let at = |h| Utc.with_ymd_and_hms(2024, 1, 15, h, 0, 0).unwrap();
        let mut early = make_entry(Level::Info, "a");
        early.set(columns::TIMESTAMP, Value::Timestamp(Some(at(8))));
        let mut late = make_entry(Level::Info, "b");
        late.set(columns::TIMESTAMP, Value::Timestamp(Some(at(12))));
        let none = make_entry(Level::Info, "c");
        let predicate = Predicate::TimeRange {
            start: Some(at(10)),
            end: None,
        };
        assert_eq!(apply(&[early, late, none], &predicate), vec![1]);
    }

    #[test]
    fn test_combinators() {
        let entries = vec![
            make_entry(Level::Error, "alpha"),
            make_entry(Level::Info, "beta"),
        ];
        let predicate = Predicate::Or(vec![
            Predicate::Level(LevelFlags::ERROR),
            Predicate::Not(Box::new(Predicate::substring("beta").unwrap())),
        ]);
        assert_eq!(apply(&entries, &predicate), vec![0]);
        assert!(apply(&entries, &Predicate::Or(Vec::new())).is_empty());
    }

    #[test]
    fn test_matches_any_line_of_entry() {
        let lines = vec![
            make_entry(Level::Error, "request failed"),
            make_entry(Level::Error, "    at handler.rs:42"),
        ];
        let predicate = Predicate::substring("handler").unwrap();
        assert!(predicate.matches_any(&lines));
    }

    #[test]
    fn test_invalid_patterns() {
        let mut filter = FilterState::default();
        assert!(matches!(
            filter.set_regex("[invalid"),
            Err(FilterError::InvalidRegex { .. })
        ));
        assert!(matches!(
            filter.set_wildcard("[unclosed"),
            Err(FilterError::InvalidWildcard { .. })
        ));
        let long = "x".repeat(MAX_FILTER_PATTERN_LENGTH + 1);
        assert!(matches!(
            Predicate::substring(&long),
            Err(FilterError::PatternTooLong { .. })
        ));
    }
}
