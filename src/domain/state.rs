//! Processing status and the transition rules between statuses.
//!
//! The transition table is a pure function so it can be checked without a
//! database. The store applies a transition only after `validate` accepts it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default retry budget for a freshly queued record
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Pipeline status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for the download worker
    Queued,

    /// Audio fetched and converted
    Downloaded,

    /// Speech-to-text finished
    Transcribed,

    /// Searchable (terminal success)
    Indexed,

    /// Last attempt failed
    Error,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Queued,
        Status::Downloaded,
        Status::Transcribed,
        Status::Indexed,
        Status::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloaded => "downloaded",
            Self::Transcribed => "transcribed",
            Self::Indexed => "indexed",
            Self::Error => "error",
        }
    }

    /// Terminal success; nothing moves forward from here
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Indexed)
    }

    /// Statuses where a record is expected to keep moving
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal() && *self != Self::Error
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown status string
#[derive(Debug, Clone, Error)]
#[error("unknown status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "downloaded" => Ok(Self::Downloaded),
            "transcribed" => Ok(Self::Transcribed),
            "indexed" => Ok(Self::Indexed),
            "error" => Ok(Self::Error),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A transition that passed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Status,
    pub to: Status,
}

/// Rejected transition (caller logic error, never retried)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Status,
    pub to: Status,
}

/// Check a transition against the whitelist
pub fn validate(from: Status, to: Status) -> Result<Transition, InvalidTransition> {
    use Status::*;

    match (from, to) {
        (Queued, Downloaded)
        | (Downloaded, Transcribed)
        | (Transcribed, Indexed)
        | (Queued, Error)
        | (Downloaded, Error)
        | (Transcribed, Error)
        | (Indexed, Error)
        | (Error, Queued) => Ok(Transition { from, to }),
        _ => Err(InvalidTransition { from, to }),
    }
}

impl Transition {
    /// Retry count after applying this transition.
    ///
    /// Entering `error` spends one attempt (never past `max_retries`),
    /// `indexed` clears the history, everything else carries it over.
    pub fn next_retry_count(&self, current: u32, max_retries: u32) -> u32 {
        match self.to {
            Status::Error => current.saturating_add(1).min(max_retries),
            Status::Indexed => 0,
            _ => current.min(max_retries),
        }
    }
}

/// Status and retry metadata for one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingState {
    pub call_uid: String,
    pub status: Status,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingState {
    /// No automatic retries left
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// One entry of the transition audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub call_uid: String,
    pub from: Status,
    pub to: Status,
    pub retry_count: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}
