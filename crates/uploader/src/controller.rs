//! Transfer decisions.
//!
//! Pure functions mapping a job and a remote response to the next step.
//! The service applies them; keeping them free of I/O lets every branch
//! be tested directly.

use skyhaul_protocol::{RangeError, parse_range_header};
use skyhaul_transfer::Job;

use crate::backend::TransferResponse;

/// What `start` should do with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartPlan {
    /// A transfer for this job is already in flight.
    AlreadyActive,
    /// Nothing to send; re-announce the completion.
    AlreadyCompleted,
    /// Go on: make sure a credential is assigned and send.
    Proceed,
}

pub(crate) fn plan_start(job: &Job, active: bool) -> StartPlan {
    if active {
        StartPlan::AlreadyActive
    } else if job.is_completed() {
        StartPlan::AlreadyCompleted
    } else {
        StartPlan::Proceed
    }
}

/// The first request of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opening {
    /// Ask the remote how much of the payload it already holds.
    Probe,
    /// Send the whole payload from byte 0.
    Full,
}

/// Chooses between probing and a full send.
///
/// A probe only makes sense for a job that already sent bytes under the
/// credential it still holds, and only if the provider keeps partial data.
pub(crate) fn opening(job: &Job, credential_replaced: bool) -> Opening {
    let resumable = job.credential().is_some_and(|c| c.resumable);
    if job.has_started() && resumable && !credential_replaced {
        Opening::Probe
    } else {
        Opening::Full
    }
}

/// How to proceed after the remote answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The remote holds the whole payload.
    Complete,
    /// The remote holds bytes `0..from`; send the rest.
    Resume { from: u64 },
    /// A resume point was promised but cannot be used.
    BadRange(RangeError),
    /// The remote lost the upload session (400, 404). Credential is fine.
    RestartSession,
    /// The credential was rejected (403).
    RestartForbidden,
    /// Anything else.
    RestartUnexpected(u16),
}

pub(crate) fn judge(response: &TransferResponse, total: u64) -> Verdict {
    match response.status {
        200 | 201 => Verdict::Complete,
        308 => judge_resume(response.range.as_deref(), total),
        400 | 404 => Verdict::RestartSession,
        403 => Verdict::RestartForbidden,
        other => Verdict::RestartUnexpected(other),
    }
}

fn judge_resume(range: Option<&str>, total: u64) -> Verdict {
    let Some(range) = range else {
        return Verdict::BadRange(RangeError::Missing);
    };
    let last = match parse_range_header(range) {
        Ok(last) => last,
        Err(e) => return Verdict::BadRange(e),
    };

    let from = last.saturating_add(1);
    if from == total {
        Verdict::Complete
    } else if from > total {
        Verdict::BadRange(RangeError::Malformed(format!(
            "{range} exceeds payload size {total}"
        )))
    } else {
        Verdict::Resume { from }
    }
}
