use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::JOB_SCHEMA_VERSION;

/// An endpoint-issued capability to upload one payload to one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    pub id: String,
    /// Where the payload is `PUT`.
    pub transfer_url: String,
    /// Where the finished upload is publicly reachable.
    pub public_url: String,
    pub content_type: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    pub provider: String,
    /// Whether the provider accepts `Content-Range` resumes.
    #[serde(default)]
    pub resumable: bool,
}

impl Credential {
    /// Remaining lifetime at `now` (negative once expired).
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        self.expires_at - now
    }

    /// Returns `true` if the credential outlives `now + margin`.
    pub fn lasts_beyond(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = TimeDelta::from_std(margin).unwrap_or(TimeDelta::MAX);
        self.remaining(now) > margin
    }

    /// Returns `true` if the credential was issued for `content_type`.
    pub fn matches(&self, content_type: &str) -> bool {
        self.content_type.eq_ignore_ascii_case(content_type)
    }
}

/// The on-disk shape of one job's metadata file.
///
/// Unknown keys are rejected so a file written by a newer build is skipped
/// instead of being half-understood.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRecord {
    pub schema: u32,
    pub id: String,
    pub byte_size: u64,
    pub content_type: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Caller-supplied values; opaque to the uploader.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub restart_count: u32,
    #[serde(default)]
    pub credential: Option<Credential>,
}

impl JobRecord {
    /// Returns `true` if the record was written with the current schema.
    pub fn is_current_schema(&self) -> bool {
        self.schema == JOB_SCHEMA_VERSION
    }
}

/// The per-workspace info file: a disposable cache of unused credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
    /// Build tag of the writer.
    #[serde(default)]
    pub build: String,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}
