/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a bound job request (UUID v7, so ids sort by creation time).
pub type RequestId = uuid::Uuid;

/// Sequential identifier of a history entry.
pub type EntryId = u32;
