//! Stream entries and the pending-entry bookkeeping read back from a store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Field carrying the JSON payload (upserts) or the raw identifier (deletes).
pub const CONTENT_FIELD: &str = "content";
/// Optional field naming the mutation; absence means upsert.
pub const OPERATION_FIELD: &str = "operation";
/// Field written by the bootstrap marker entry.
pub const INIT_FIELD: &str = "init";

/// Position of an entry in a stream.
///
/// Ids have the `<milliseconds>-<sequence>` shape used by Redis Streams and
/// order by milliseconds first, then sequence. The default is [`EntryId::ZERO`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    /// The smallest possible id. Groups created at this position see every entry.
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    /// Create an id from its two components.
    #[must_use]
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Milliseconds component.
    #[must_use]
    pub fn ms(&self) -> u64 {
        self.ms
    }

    /// Sequence component.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The id immediately following this one.
    #[must_use]
    pub fn next(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms.saturating_add(1),
                seq: 0,
            },
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        let ms = ms
            .parse::<u64>()
            .map_err(|_| format!("Invalid entry id: {s}"))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|_| format!("Invalid entry id: {s}"))?;
        Ok(Self { ms, seq })
    }
}

/// Mutation kind carried in the `operation` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    /// Wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Read => "READ",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATE" => Ok(Self::Create),
            "READ" => Ok(Self::Read),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(format!("Unknown operation: {s}")),
        }
    }
}

/// One logged unit: an id, the stream it belongs to and its field mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    pub stream_key: String,
    pub fields: BTreeMap<String, String>,
}

impl Entry {
    /// Create an entry.
    pub fn new(id: EntryId, stream_key: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            id,
            stream_key: stream_key.into(),
            fields,
        }
    }

    /// Get a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// The `content` field.
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        self.field(CONTENT_FIELD)
    }

    /// The raw `operation` field, as written by the producer.
    #[must_use]
    pub fn raw_operation(&self) -> Option<&str> {
        self.field(OPERATION_FIELD)
    }

    /// The parsed `operation` field.
    ///
    /// Unrecognised values yield `None` and are treated like an absent field.
    #[must_use]
    pub fn operation(&self) -> Option<Operation> {
        self.raw_operation().and_then(|op| op.parse().ok())
    }

    /// Whether this entry deletes rather than upserts.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.operation() == Some(Operation::Delete)
    }

    /// Whether this entry is the bootstrap marker written when the stream was created.
    #[must_use]
    pub fn is_init_marker(&self) -> bool {
        self.fields.contains_key(INIT_FIELD) && !self.fields.contains_key(CONTENT_FIELD)
    }
}

/// Build the field mapping for an append.
#[must_use]
pub fn entry_fields(content: impl Into<String>, operation: Option<Operation>) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert(CONTENT_FIELD.to_string(), content.into());
    if let Some(op) = operation {
        fields.insert(OPERATION_FIELD.to_string(), op.as_str().to_string());
    }
    fields
}

/// Inclusive id range used when listing pending entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryRange {
    pub start: Option<EntryId>,
    pub end: Option<EntryId>,
}

impl EntryRange {
    /// Every id.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Ids between `start` and `end`, both included.
    #[must_use]
    pub fn closed(start: EntryId, end: EntryId) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Whether `id` falls inside the range.
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.start.map_or(true, |s| id >= s) && self.end.map_or(true, |e| id <= e)
    }
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Offset zero: every entry already in the stream is delivered.
    Beginning,
    /// Last entry in the stream: only entries appended afterwards are delivered.
    Latest,
    /// Every entry with an id greater than this one is delivered.
    After(EntryId),
}

/// A delivered-but-unacknowledged entry in a group's pending list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub delivery_count: u64,
    /// Time since the entry was last delivered to a consumer.
    pub idle: Duration,
}

/// Summary of a group's pending list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingSummary {
    pub total: u64,
    pub lowest: Option<EntryId>,
    pub highest: Option<EntryId>,
    /// Pending count per consumer name.
    pub consumers: Vec<(String, u64)>,
}

impl PendingSummary {
    /// True when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_parse_and_order() {
        let a: EntryId = "1700000000000-0".parse().unwrap();
        let b: EntryId = "1700000000000-1".parse().unwrap();
        let c: EntryId = "1700000000001".parse().unwrap();

        assert!(a < b);
        assert!(b < c);
        assert_eq!(c, EntryId::new(1_700_000_000_001, 0));
        assert_eq!(a.to_string(), "1700000000000-0");
        assert!("abc-1".parse::<EntryId>().is_err());
        assert!("1-x".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_default_is_zero() {
        assert_eq!(EntryId::default(), EntryId::ZERO);
        assert!(EntryId::default() < EntryId::new(0, 1));
    }

    #[test]
    fn test_entry_id_next() {
        assert_eq!(EntryId::new(5, 1).next(), EntryId::new(5, 2));
        assert_eq!(EntryId::new(5, u64::MAX).next(), EntryId::new(6, 0));
    }

    #[test]
    fn test_operation_is_case_insensitive() {
        assert_eq!("delete".parse::<Operation>().unwrap(), Operation::Delete);
        assert_eq!("Update".parse::<Operation>().unwrap(), Operation::Update);
        assert!("UPSERT".parse::<Operation>().is_err());
    }

    #[test]
    fn test_entry_operation_defaults_to_upsert() {
        let upsert = Entry::new(EntryId::new(1, 0), "s", entry_fields("{}", None));
        assert_eq!(upsert.operation(), None);
        assert!(!upsert.is_delete());

        let mut fields = entry_fields("7", None);
        fields.insert(OPERATION_FIELD.to_string(), "delete".to_string());
        let delete = Entry::new(EntryId::new(2, 0), "s", fields);
        assert!(delete.is_delete());
        assert_eq!(delete.content(), Some("7"));
    }

    #[test]
    fn test_init_marker_detection() {
        let mut fields = BTreeMap::new();
        fields.insert(INIT_FIELD.to_string(), "true".to_string());
        let marker = Entry::new(EntryId::new(1, 0), "s", fields);
        assert!(marker.is_init_marker());

        let real = Entry::new(EntryId::new(2, 0), "s", entry_fields("{}", None));
        assert!(!real.is_init_marker());
    }

    #[test]
    fn test_range_contains() {
        let range = EntryRange::closed(EntryId::new(2, 0), EntryId::new(4, 0));
        assert!(range.contains(EntryId::new(2, 0)));
        assert!(range.contains(EntryId::new(4, 0)));
        assert!(!range.contains(EntryId::new(4, 1)));
        assert!(EntryRange::unbounded().contains(EntryId::ZERO));
    }
}
