use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A record as yielded by an extraction client, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Identifier assigned by the third-party service.
    pub external_id: String,
    pub data: serde_json::Value,
}

impl SourceRecord {
    pub fn new(external_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            external_id: external_id.into(),
            data,
        }
    }
}

/// A stored record. `offset` is its position in the job's sequence and
/// never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub offset: u64,
    pub external_id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Where the next page fetch should start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCursor {
    /// Records already stored for the job.
    pub offset: u64,
    /// Continuation handed back by the previous page of this run, if any.
    pub token: Option<String>,
}

impl SourceCursor {
    pub fn at(offset: u64) -> Self {
        Self {
            offset,
            token: None,
        }
    }
}

/// What follows a fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    More { token: Option<String> },
    Done,
}

/// One page returned by an extraction client.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePage {
    pub records: Vec<SourceRecord>,
    pub continuation: Continuation,
}

impl SourcePage {
    pub fn more(records: Vec<SourceRecord>, token: Option<String>) -> Self {
        Self {
            records,
            continuation: Continuation::More { token },
        }
    }

    pub fn last(records: Vec<SourceRecord>) -> Self {
        Self {
            records,
            continuation: Continuation::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.continuation == Continuation::Done
    }
}

/// Result of appending a batch to a job's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Offset assigned to the first record of the batch.
    pub first_offset: u64,
    /// Length of the job's sequence after the append.
    pub len: u64,
}
