// logtail - core/property.rs
//
// Source-level properties (size, timestamps, progress, error state).
// Like columns, properties are identified by immutable descriptors and an
// unsupported property reads as its descriptor's default.

use crate::core::encoding::Encoding;
use chrono::{DateTime, Duration, Utc};

/// The type of a property's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Text,
    Count,
    Size,
    Timestamp,
    Percentage,
    Encoding,
    Error,
    Duration,
}

/// Why a source currently has no (or stale) content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorFlag {
    #[default]
    None,
    SourceDoesNotExist,
    SourceCannotBeAccessed,
}

impl ErrorFlag {
    pub fn is_error(&self) -> bool {
        *self != ErrorFlag::None
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorFlag::None => "ok",
            ErrorFlag::SourceDoesNotExist => "does not exist",
            ErrorFlag::SourceCannotBeAccessed => "cannot be accessed",
        }
    }
}

/// Immutable identifier of one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyDescriptor {
    id: &'static str,
    kind: PropertyKind,
}

impl PropertyDescriptor {
    pub const fn new(id: &'static str, kind: PropertyKind) -> Self {
        Self { id, kind }
    }

    pub const fn id(&self) -> &'static str {
        self.id
    }

    pub const fn kind(&self) -> PropertyKind {
        self.kind
    }

    pub fn default_value(&self) -> PropertyValue {
        match self.kind {
            PropertyKind::Text => PropertyValue::Text(None),
            PropertyKind::Count => PropertyValue::Count(0),
            PropertyKind::Size => PropertyValue::Size(None),
            PropertyKind::Timestamp => PropertyValue::Timestamp(None),
            PropertyKind::Percentage => PropertyValue::Percentage(0.0),
            PropertyKind::Encoding => PropertyValue::Encoding(None),
            PropertyKind::Error => PropertyValue::Error(ErrorFlag::None),
            PropertyKind::Duration => PropertyValue::Duration(None),
        }
    }
}

/// A single typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(Option<String>),
    Count(usize),
    /// Size in bytes.
    Size(Option<u64>),
    Timestamp(Option<DateTime<Utc>>),
    /// Percentage in `0.0..=100.0`.
    Percentage(f64),
    Encoding(Option<Encoding>),
    Error(ErrorFlag),
    Duration(Option<Duration>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::Text(_) => PropertyKind::Text,
            PropertyValue::Count(_) => PropertyKind::Count,
            PropertyValue::Size(_) => PropertyKind::Size,
            PropertyValue::Timestamp(_) => PropertyKind::Timestamp,
            PropertyValue::Percentage(_) => PropertyKind::Percentage,
            PropertyValue::Encoding(_) => PropertyKind::Encoding,
            PropertyValue::Error(_) => PropertyKind::Error,
            PropertyValue::Duration(_) => PropertyKind::Duration,
        }
    }
}

/// A set of property values, typically filled by
/// `LogSource::get_all_properties`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertySet {
    values: Vec<(PropertyDescriptor, PropertyValue)>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding the default of every given property.
    pub fn with_defaults(descriptors: &[PropertyDescriptor]) -> Self {
        Self {
            values: descriptors
                .iter()
                .map(|d| (*d, d.default_value()))
                .collect(),
        }
    }

    pub fn value(&self, descriptor: &PropertyDescriptor) -> Option<&PropertyValue> {
        self.values
            .iter()
            .find(|(d, _)| d == descriptor)
            .map(|(_, v)| v)
    }

    /// The value of `descriptor`, or its default when not present.
    pub fn get(&self, descriptor: &PropertyDescriptor) -> PropertyValue {
        self.value(descriptor)
            .cloned()
            .unwrap_or_else(|| descriptor.default_value())
    }

    /// Store a value; a value of the wrong kind is ignored.
    pub fn set(&mut self, descriptor: PropertyDescriptor, value: PropertyValue) {
        if value.kind() != descriptor.kind() {
            tracing::warn!(
                property = descriptor.id(),
                "Property value kind does not match descriptor; ignored"
            );
            return;
        }
        match self.values.iter_mut().find(|(d, _)| *d == descriptor) {
            Some(slot) => slot.1 = value,
            None => self.values.push((descriptor, value)),
        }
    }

    pub fn contains(&self, descriptor: &PropertyDescriptor) -> bool {
        self.value(descriptor).is_some()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.values.iter().map(|(d, _)| d)
    }

    /// Copy every value into `destination`, overwriting what it holds.
    pub fn copy_to(&self, destination: &mut PropertySet) {
        for (descriptor, value) in &self.values {
            destination.set(*descriptor, value.clone());
        }
    }

    pub fn text(&self, descriptor: &PropertyDescriptor) -> Option<&str> {
        match self.value(descriptor) {
            Some(PropertyValue::Text(t)) => t.as_deref(),
            _ => None,
        }
    }

    pub fn count(&self, descriptor: &PropertyDescriptor) -> usize {
        match self.value(descriptor) {
            Some(PropertyValue::Count(n)) => *n,
            _ => 0,
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self.value(&properties::SIZE) {
            Some(PropertyValue::Size(s)) => *s,
            _ => None,
        }
    }

    pub fn timestamp(&self, descriptor: &PropertyDescriptor) -> Option<DateTime<Utc>> {
        match self.value(descriptor) {
            Some(PropertyValue::Timestamp(t)) => *t,
            _ => None,
        }
    }

    pub fn percentage_processed(&self) -> f64 {
        match self.value(&properties::PERCENTAGE_PROCESSED) {
            Some(PropertyValue::Percentage(p)) => *p,
            _ => 0.0,
        }
    }

    pub fn encoding(&self) -> Option<Encoding> {
        match self.value(&properties::ENCODING) {
            Some(PropertyValue::Encoding(e)) => *e,
            _ => None,
        }
    }

    pub fn error(&self) -> ErrorFlag {
        match self.value(&properties::ERROR) {
            Some(PropertyValue::Error(e)) => *e,
            _ => ErrorFlag::None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self.value(&properties::DURATION) {
            Some(PropertyValue::Duration(d)) => *d,
            _ => None,
        }
    }
}

/// Well-known properties.
pub mod properties {
    use super::{PropertyDescriptor, PropertyKind};

    /// Display name (file path for text sources).
    pub const NAME: PropertyDescriptor = PropertyDescriptor::new("name", PropertyKind::Text);

    pub const LOG_ENTRY_COUNT: PropertyDescriptor =
        PropertyDescriptor::new("log_entry_count", PropertyKind::Count);

    pub const SIZE: PropertyDescriptor = PropertyDescriptor::new("size", PropertyKind::Size);

    pub const CREATED: PropertyDescriptor =
        PropertyDescriptor::new("created", PropertyKind::Timestamp);

    pub const LAST_MODIFIED: PropertyDescriptor =
        PropertyDescriptor::new("last_modified", PropertyKind::Timestamp);

    pub const PERCENTAGE_PROCESSED: PropertyDescriptor =
        PropertyDescriptor::new("percentage_processed", PropertyKind::Percentage);

    pub const ENCODING: PropertyDescriptor =
        PropertyDescriptor::new("encoding", PropertyKind::Encoding);

    pub const ERROR: PropertyDescriptor = PropertyDescriptor::new("error", PropertyKind::Error);

    pub const START_TIMESTAMP: PropertyDescriptor =
        PropertyDescriptor::new("start_timestamp", PropertyKind::Timestamp);

    pub const END_TIMESTAMP: PropertyDescriptor =
        PropertyDescriptor::new("end_timestamp", PropertyKind::Timestamp);

    pub const DURATION: PropertyDescriptor =
        PropertyDescriptor::new("duration", PropertyKind::Duration);

    pub const MAX_CHARACTERS_IN_LINE: PropertyDescriptor =
        PropertyDescriptor::new("max_characters_in_line", PropertyKind::Count);

    pub const UNTIMESTAMPED_COUNT: PropertyDescriptor =
        PropertyDescriptor::new("untimestamped_count", PropertyKind::Count);

    /// Properties every source reports.
    pub const MINIMUM: &[PropertyDescriptor] = &[
        LOG_ENTRY_COUNT,
        SIZE,
        LAST_MODIFIED,
        PERCENTAGE_PROCESSED,
        ERROR,
        START_TIMESTAMP,
        END_TIMESTAMP,
        DURATION,
    ];
}
