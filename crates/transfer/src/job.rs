use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use skyhaul_protocol::constants::JOB_SCHEMA_VERSION;
use skyhaul_protocol::{Credential, JobRecord};

use crate::TransferError;
use crate::progress::SpeedCalculator;

/// Where a job is in its lifetime.
///
/// A completed job always carries the credential it was uploaded with, so
/// "completed without a destination" cannot be represented.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPhase {
    /// No byte has been transmitted yet.
    Queued { credential: Option<Credential> },
    /// At least one byte went out; `started_at` marks the first one.
    Started {
        started_at: DateTime<Utc>,
        credential: Option<Credential>,
    },
    /// The remote endpoint acknowledged the whole payload.
    Completed {
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
        credential: Credential,
    },
}

/// One queued, potentially resumable file upload.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    id: String,
    byte_size: u64,
    content_type: String,
    created_at: DateTime<Utc>,
    metadata: BTreeMap<String, serde_json::Value>,
    restart_count: u32,
    phase: JobPhase,
    /// Not persisted.
    bytes_sent: u64,
}

impl Job {
    /// Creates a new queued job with a fresh process-wide unique id.
    pub fn new(
        byte_size: u64,
        content_type: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            byte_size,
            content_type: content_type.into(),
            created_at: whole_seconds(Utc::now()),
            metadata,
            restart_count: 0,
            phase: JobPhase::Queued { credential: None },
            bytes_sent: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn phase(&self) -> &JobPhase {
        &self.phase
    }

    /// Returns the assigned credential, if any.
    pub fn credential(&self) -> Option<&Credential> {
        match &self.phase {
            JobPhase::Queued { credential } | JobPhase::Started { credential, .. } => {
                credential.as_ref()
            }
            JobPhase::Completed { credential, .. } => Some(credential),
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.phase {
            JobPhase::Queued { .. } => None,
            JobPhase::Started { started_at, .. } => Some(*started_at),
            JobPhase::Completed { started_at, .. } => *started_at,
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.phase {
            JobPhase::Completed { completed_at, .. } => Some(*completed_at),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.phase, JobPhase::Completed { .. })
    }

    /// Returns `true` once the first byte has gone out.
    pub fn has_started(&self) -> bool {
        self.started_at().is_some()
    }

    /// Assigns a credential, resetting the restart counter.
    ///
    /// Ignored for completed jobs, whose destination is final.
    pub fn assign_credential(&mut self, new: Credential) {
        match &mut self.phase {
            JobPhase::Queued { credential } | JobPhase::Started { credential, .. } => {
                *credential = Some(new);
                self.restart_count = 0;
            }
            JobPhase::Completed { .. } => {}
        }
    }

    /// Drops the assigned credential and returns it.
    pub fn discard_credential(&mut self) -> Option<Credential> {
        match &mut self.phase {
            JobPhase::Queued { credential } | JobPhase::Started { credential, .. } => {
                credential.take()
            }
            JobPhase::Completed { .. } => None,
        }
    }

    /// Records the first transmitted byte. Returns `true` on the transition.
    pub fn mark_started(&mut self, now: DateTime<Utc>) -> bool {
        if let JobPhase::Queued { credential } = &mut self.phase {
            let credential = credential.take();
            self.phase = JobPhase::Started {
                started_at: whole_seconds(now),
                credential,
            };
            true
        } else {
            false
        }
    }

    /// Updates the in-memory count of bytes sent.
    pub fn record_progress(&mut self, bytes_sent: u64) {
        self.bytes_sent = bytes_sent.min(self.byte_size);
    }

    /// Counts one restart and rewinds the progress counter.
    pub fn note_restart(&mut self) {
        self.restart_count = self.restart_count.saturating_add(1);
        self.bytes_sent = 0;
    }

    /// Rewinds the progress counter without counting a restart.
    pub fn rewind(&mut self) {
        self.bytes_sent = 0;
    }

    /// Marks the job completed at `now` and returns its immutable snapshot.
    ///
    /// A second call keeps the original completion time.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<CompletedJob, TransferError> {
        if !self.is_completed() {
            let started_at = self.started_at();
            let credential = self
                .discard_credential()
                .ok_or_else(|| TransferError::NoCredential(self.id.clone()))?;
            self.phase = JobPhase::Completed {
                started_at,
                completed_at: whole_seconds(now),
                credential,
            };
            self.bytes_sent = self.byte_size;
        }
        self.completed_snapshot()
            .ok_or_else(|| TransferError::NoCredential(self.id.clone()))
    }

    /// Returns the completed snapshot if the job has finished.
    pub fn completed_snapshot(&self) -> Option<CompletedJob> {
        match &self.phase {
            JobPhase::Completed {
                started_at,
                completed_at,
                credential,
            } => Some(CompletedJob {
                id: self.id.clone(),
                byte_size: self.byte_size,
                content_type: self.content_type.clone(),
                created_at: self.created_at,
                started_at: *started_at,
                completed_at: *completed_at,
                metadata: self.metadata.clone(),
                credential: credential.clone(),
            }),
            _ => None,
        }
    }

    /// Returns a progress snapshot without speed information.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            byte_size: self.byte_size,
            content_type: self.content_type.clone(),
            bytes_sent: self.bytes_sent,
            restart_count: self.restart_count,
            started_at: self.started_at(),
            completed_at: self.completed_at(),
            metadata: self.metadata.clone(),
            bytes_per_second: 0.0,
            eta: None,
        }
    }

    /// Converts the job to its on-disk record.
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            schema: JOB_SCHEMA_VERSION,
            id: self.id.clone(),
            byte_size: self.byte_size,
            content_type: self.content_type.clone(),
            created_at: self.created_at,
            started_at: self.started_at(),
            completed_at: self.completed_at(),
            metadata: self.metadata.clone(),
            restart_count: self.restart_count,
            credential: self.credential().cloned(),
        }
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = TransferError;

    fn try_from(record: JobRecord) -> Result<Self, Self::Error> {
        if !record.is_current_schema() {
            return Err(TransferError::InvalidRecord(format!(
                "unsupported schema version {}",
                record.schema
            )));
        }
        if record.id.is_empty() {
            return Err(TransferError::InvalidRecord("empty job id".into()));
        }

        let phase = match (record.started_at, record.completed_at, record.credential) {
            (started_at, Some(completed_at), Some(credential)) => JobPhase::Completed {
                started_at,
                completed_at,
                credential,
            },
            (_, Some(_), None) => {
                return Err(TransferError::InvalidRecord(format!(
                    "job {} is completed without a credential",
                    record.id
                )));
            }
            (Some(started_at), None, credential) => JobPhase::Started {
                started_at,
                credential,
            },
            (None, None, credential) => JobPhase::Queued { credential },
        };

        let bytes_sent = match phase {
            JobPhase::Completed { .. } => record.byte_size,
            _ => 0,
        };

        Ok(Self {
            id: record.id,
            byte_size: record.byte_size,
            content_type: record.content_type,
            created_at: record.created_at,
            metadata: record.metadata,
            restart_count: record.restart_count,
            phase,
            bytes_sent,
        })
    }
}

/// Timestamps are persisted as epoch seconds; keep memory in step with disk.
fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(0)
}

/// Immutable record of a finished job, used only for outward notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedJob {
    pub id: String,
    pub byte_size: u64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub credential: Credential,
}

impl CompletedJob {
    /// Public location of the uploaded payload.
    pub fn public_url(&self) -> &str {
        &self.credential.public_url
    }
}

/// Point-in-time view of a job for progress observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub byte_size: u64,
    pub content_type: String,
    pub bytes_sent: u64,
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

impl JobSnapshot {
    /// Fills in speed and ETA from a speed calculator.
    pub fn with_speed(mut self, speed: &SpeedCalculator) -> Self {
        self.bytes_per_second = speed.bytes_per_second();
        self.eta = speed.eta(self.byte_size.saturating_sub(self.bytes_sent));
        self
    }

    /// Fraction of the payload sent, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.byte_size == 0 {
            return if self.completed_at.is_some() { 1.0 } else { 0.0 };
        }
        self.bytes_sent as f64 / self.byte_size as f64
    }
}
