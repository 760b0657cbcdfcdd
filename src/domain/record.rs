//! Ingested call records and their record-level processing stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors building or updating a record
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("feed payload is missing field: {0}")]
    MissingField(&'static str),

    #[error("feed payload field {field} has invalid value: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("invalid stage change: {from} -> {to}")]
    InvalidStage {
        from: ProcessingStage,
        to: ProcessingStage,
    },

    #[error("unknown processing stage: {0}")]
    UnknownStage(String),
}

/// Where the download/convert worker is with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Pending,
    Downloading,
    Downloaded,
    Converting,
    Completed,
    Failed,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Converting => "converting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// A worker holds this record and may have died holding it
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Downloading | Self::Converting)
    }

    /// Whether the record may move from `self` to `next`
    pub fn can_move_to(&self, next: ProcessingStage) -> bool {
        use ProcessingStage::*;

        match (self, next) {
            (Pending, Downloading)
            | (Downloading, Downloaded)
            | (Downloaded, Converting)
            | (Converting, Completed)
            | (Failed, Pending)
            | (Downloading, Pending)
            | (Converting, Pending) => true,
            (Completed, Failed) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStage {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "downloaded" => Ok(Self::Downloaded),
            "converting" => Ok(Self::Converting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RecordError::UnknownStage(other.to_string())),
        }
    }
}

impl ToSql for ProcessingStage {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ProcessingStage {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A stored call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub call_uid: String,
    pub group_id: Option<String>,
    pub feed_id: Option<i64>,
    pub tg_id: Option<i64>,
    pub playlist_uuid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub url: String,
    pub size_bytes: Option<i64>,
    pub raw_json: serde_json::Value,
    pub processed: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    pub processing_stage: ProcessingStage,
    pub picked_at: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// A call as handed over by the feed poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub call_uid: String,
    pub group_id: Option<String>,
    pub feed_id: Option<i64>,
    pub tg_id: Option<i64>,
    pub playlist_uuid: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub url: String,
    pub size_bytes: Option<i64>,
    pub raw_json: serde_json::Value,
}

impl NewRecord {
    /// Minimal record, mostly for tests and manual ingestion
    pub fn new(call_uid: impl Into<String>, started_at: DateTime<Utc>, url: impl Into<String>) -> Self {
        Self {
            call_uid: call_uid.into(),
            group_id: None,
            feed_id: None,
            tg_id: None,
            playlist_uuid: None,
            started_at,
            ended_at: None,
            duration_ms: None,
            url: url.into(),
            size_bytes: None,
            raw_json: serde_json::Value::Null,
        }
    }

    /// Build a record from a feed call payload.
    ///
    /// The uid is `{groupId}-{ts}`; `start_ts`/`end_ts` fall back to `ts`.
    pub fn from_feed_call(
        playlist_uuid: Option<&str>,
        call: &serde_json::Value,
    ) -> Result<Self, RecordError> {
        let group_id = match call.get("groupId") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(RecordError::InvalidField {
                    field: "groupId",
                    value: other.to_string(),
                })
            }
            None => return Err(RecordError::MissingField("groupId")),
        };

        let ts = call
            .get("ts")
            .ok_or(RecordError::MissingField("ts"))?
            .as_i64()
            .ok_or_else(|| RecordError::InvalidField {
                field: "ts",
                value: call["ts"].to_string(),
            })?;

        let url = call
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or(RecordError::MissingField("url"))?
            .to_string();

        let start_ts = call.get("start_ts").and_then(|v| v.as_i64()).unwrap_or(ts);
        let end_ts = call.get("end_ts").and_then(|v| v.as_i64()).unwrap_or(ts);

        let started_at = epoch_seconds(start_ts, "start_ts")?;
        let ended_at = epoch_seconds(end_ts, "end_ts")?;

        let duration_ms = call
            .get("duration")
            .and_then(|d| d.as_f64())
            .map(|secs| (secs * 1000.0) as i64);

        Ok(Self {
            call_uid: format!("{}-{}", group_id, ts),
            group_id: Some(group_id),
            feed_id: call.get("feedId").and_then(|v| v.as_i64()),
            tg_id: call.get("tgId").and_then(|v| v.as_i64()),
            playlist_uuid: playlist_uuid.map(str::to_string),
            started_at,
            ended_at: Some(ended_at),
            duration_ms,
            url,
            size_bytes: call.get("size").and_then(|v| v.as_i64()),
            raw_json: call.clone(),
        })
    }
}

fn epoch_seconds(secs: i64, field: &'static str) -> Result<DateTime<Utc>, RecordError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| RecordError::InvalidField {
            field,
            value: secs.to_string(),
        })
}

/// Result of an idempotent insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New record with a queued processing state
    Inserted { partition: String },

    /// A record with this uid already exists
    Duplicate,
}

impl InsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

/// One outbound request made by the feed poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallMetric {
    pub endpoint: String,
    pub status_code: Option<u16>,
    pub duration_ms: i64,
    pub response_size: Option<i64>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Operational log line persisted for dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemLogEntry {
    pub component: String,
    pub level: String,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}
