//! Job lifecycle events.

use skyhaul_protocol::Credential;
use skyhaul_transfer::{CompletedJob, JobSnapshot};
use tokio::sync::mpsc;
use tracing::trace;

/// Lifecycle events published to observers.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Bytes are about to flow for a job.
    TransferStarted {
        job: JobSnapshot,
        credential: Credential,
    },
    /// More bytes were sent.
    Progress(JobSnapshot),
    /// The remote endpoint holds the whole payload.
    Completed(CompletedJob),
    /// Startup reconciliation is done; no further wake time is needed.
    BackgroundWorkFinished,
}

/// Publishes events, holding back completions until reporting is enabled.
///
/// Startup reconciliation can surface completions that happened while the
/// process was down; they are delivered once the host has its listeners in
/// place.
pub(crate) struct EventNotifier {
    tx: mpsc::UnboundedSender<UploadEvent>,
    reporting: bool,
    held: Vec<CompletedJob>,
}

impl EventNotifier {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                reporting: false,
                held: Vec::new(),
            },
            rx,
        )
    }

    pub(crate) fn transfer_started(&self, job: JobSnapshot, credential: Credential) {
        self.send(UploadEvent::TransferStarted { job, credential });
    }

    pub(crate) fn progress(&self, job: JobSnapshot) {
        self.send(UploadEvent::Progress(job));
    }

    pub(crate) fn completed(&mut self, job: CompletedJob) {
        if self.reporting {
            self.send(UploadEvent::Completed(job));
        } else if !self.held.iter().any(|held| held.id == job.id) {
            self.held.push(job);
        }
    }

    pub(crate) fn background_work_finished(&self) {
        self.send(UploadEvent::BackgroundWorkFinished);
    }

    /// Starts reporting completions, flushing any held back so far.
    pub(crate) fn enable_reporting(&mut self) {
        if self.reporting {
            return;
        }
        self.reporting = true;
        for job in std::mem::take(&mut self.held) {
            self.send(UploadEvent::Completed(job));
        }
    }

    /// Drops held completions of a job that no longer exists.
    pub(crate) fn forget(&mut self, job_id: &str) {
        self.held.retain(|held| held.id != job_id);
    }

    /// Drops every held completion (workspace swap).
    pub(crate) fn forget_all(&mut self) {
        self.held.clear();
    }

    fn send(&self, event: UploadEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event observer attached");
        }
    }
}
