//! The upload service: a cloneable handle in front of a single actor task.
//!
//! The actor owns the open workspace, the job table, the credential pool
//! and the set of active transfers. Commands from handles, transfer events
//! from the backend, and completions of offloaded work (payload placement,
//! tail slicing, allocation, retry timers) all arrive over channels and are
//! handled one at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use skyhaul_credentials::{CredentialAllocator, CredentialError, CredentialPool, EnsureOutcome};
use skyhaul_protocol::Credential;
use skyhaul_transfer::{
    Job, JobSnapshot, SpeedCalculator, TransferError, detect_content_type, validate_source,
    write_resume_tail,
};
use skyhaul_workspace::{StoreError, Workspace};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendError, TransferBackend, TransferEvent, TransferRequest, TransferResponse,
};
use crate::config::UploaderConfig;
use crate::controller::{Opening, StartPlan, Verdict, judge, opening, plan_start};
use crate::error::SubmitError;
use crate::events::{EventNotifier, UploadEvent};
use crate::platform::{Platform, SessionProvider};
use crate::recovery::plan_recovery;
use crate::redact::Redactor;

const COMMAND_BUFFER: usize = 64;

/// A local file to upload.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub path: PathBuf,
    /// Declared content type; detected from the extension when `None`.
    pub content_type: Option<String>,
    /// Move the file into the workspace instead of copying it.
    pub move_file: bool,
    /// Opaque caller data carried through to the completion event.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Submission {
    /// Submits a copy of `path`; the original is left alone.
    pub fn copy(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            content_type: None,
            move_file: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Submits `path` by moving it into the workspace.
    pub fn moving(path: impl Into<PathBuf>) -> Self {
        Self {
            move_file: true,
            ..Self::copy(path)
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A job that holds a credential but whose payload is not placed yet.
#[derive(Debug)]
struct Reservation {
    job_id: String,
    payload_path: PathBuf,
    generation: u64,
}

enum Command {
    OpenSession {
        reply: oneshot::Sender<Result<usize, SubmitError>>,
    },
    CloseSession {
        reply: oneshot::Sender<()>,
    },
    Submit {
        byte_size: u64,
        content_type: String,
        metadata: BTreeMap<String, serde_json::Value>,
        source: PathBuf,
        move_file: bool,
        reply: oneshot::Sender<Result<JobSnapshot, SubmitError>>,
    },
    Start {
        job_id: String,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        job_id: String,
        reply: oneshot::Sender<bool>,
    },
    Acknowledge {
        job_id: String,
        reply: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    Get {
        job_id: String,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    Refill {
        content_type: String,
        reply: oneshot::Sender<()>,
    },
    EnableReporting,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Completions of work the actor offloaded.
enum Internal {
    WorkspaceOpened {
        generation: u64,
        result: Result<(Workspace, Vec<Job>), StoreError>,
        reply: oneshot::Sender<Result<usize, SubmitError>>,
    },
    ResumePrepared {
        generation: u64,
        job_id: String,
        resume_from: u64,
        result: Result<u64, TransferError>,
    },
    Refilled {
        generation: u64,
        content_type: String,
        result: Result<Vec<Credential>, CredentialError>,
    },
    RetryDue {
        generation: u64,
        job_id: String,
    },
    /// The payload of a reserved job was copied or moved into place.
    Placed {
        reservation: Reservation,
        source: PathBuf,
        move_file: bool,
        placed: io::Result<()>,
        reply: oneshot::Sender<Result<JobSnapshot, SubmitError>>,
    },
}

/// What the actor is doing for a job outside the job record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    /// The backend runs transfer `0` for the job.
    Transfer(u64),
    /// The resume tail is being written.
    Preparing,
}

/// Handle to the upload service. Cheap to clone.
#[derive(Clone)]
pub struct UploadService {
    commands: mpsc::Sender<Command>,
    events: Arc<Mutex<Option<mpsc::UnboundedReceiver<UploadEvent>>>>,
}

impl UploadService {
    /// Spawns the service actor on the current tokio runtime.
    ///
    /// Nothing is loaded until [`UploadService::open_session`].
    pub fn spawn(
        config: UploaderConfig,
        session: Arc<dyn SessionProvider>,
        allocator: Arc<dyn CredentialAllocator>,
        backend: Arc<dyn TransferBackend>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notifier, events_rx) = EventNotifier::new();

        let actor = Actor {
            pool: CredentialPool::new(config.pool_config()),
            config,
            session,
            allocator,
            backend,
            platform,
            notifier,
            transfer_tx,
            internal_tx,
            generation: 0,
            workspace: None,
            jobs: HashMap::new(),
            pending: HashMap::new(),
            placing: HashSet::new(),
            active: HashMap::new(),
            speeds: HashMap::new(),
            refilling: HashMap::new(),
        };
        tokio::spawn(actor.run(commands_rx, transfer_rx, internal_rx));

        Self {
            commands: commands_tx,
            events: Arc::new(Mutex::new(Some(events_rx))),
        }
    }

    /// Hands the event stream to its single observer. Returns `None` after
    /// the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<UploadEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Opens the signed-in account's workspace and resumes its jobs.
    ///
    /// Transfers the backend still runs are adopted, every other pending
    /// job is started. Returns the number of jobs loaded.
    pub async fn open_session(&self) -> Result<usize, SubmitError> {
        self.request(|reply| Command::OpenSession { reply }).await?
    }

    /// Closes the workspace, abandoning in-flight transfers.
    pub async fn close_session(&self) -> Result<(), SubmitError> {
        self.request(|reply| Command::CloseSession { reply }).await
    }

    /// Queues a local file for upload.
    ///
    /// Fails without side effects when the file is unusable, nobody is
    /// signed in, or no credential can be obtained. When the cache is
    /// empty, one refill is awaited before giving up.
    pub async fn submit(&self, submission: Submission) -> Result<JobSnapshot, SubmitError> {
        let Submission {
            path,
            content_type,
            move_file,
            metadata,
        } = submission;

        let (byte_size, content_type) = {
            let path = path.clone();
            blocking(move || -> Result<(u64, String), TransferError> {
                let size = validate_source(&path)?;
                let content_type =
                    content_type.unwrap_or_else(|| detect_content_type(&path).to_string());
                Ok((size, content_type))
            })
            .await??
        };

        // Once the actor accepted the command it finishes the submission
        // even if this future is dropped.
        let first = self
            .submit_prepared(byte_size, &content_type, &metadata, &path, move_file)
            .await;
        match first {
            Err(SubmitError::NoCredential) => {
                debug!(%content_type, "credential cache empty, waiting for one refill");
                self.refill(&content_type).await?;
                self.submit_prepared(byte_size, &content_type, &metadata, &path, move_file)
                    .await
            }
            other => other,
        }
    }

    /// Starts (or resumes) a job. Returns `false` for unknown ids.
    pub async fn start(&self, job_id: &str) -> Result<bool, SubmitError> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Start { job_id, reply }).await
    }

    /// Cancels a job in any state and deletes its files.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, SubmitError> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Cancel { job_id, reply }).await
    }

    /// Forgets a completed job and deletes its files.
    ///
    /// Returns `false` if the job is unknown or not completed.
    pub async fn acknowledge(&self, job_id: &str) -> Result<bool, SubmitError> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Acknowledge { job_id, reply })
            .await
    }

    /// All jobs of the open workspace, oldest first.
    pub async fn list(&self) -> Result<Vec<JobSnapshot>, SubmitError> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<JobSnapshot>, SubmitError> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Get { job_id, reply }).await
    }

    /// Tops up the credential cache for `content_type` if it is low, and
    /// waits for the allocation round trip to finish.
    pub async fn refill(&self, content_type: &str) -> Result<(), SubmitError> {
        let content_type = content_type.to_string();
        self.request(|reply| Command::Refill {
            content_type,
            reply,
        })
        .await
    }

    /// Starts delivering completion events, including held-back ones.
    pub async fn enable_reporting(&self) -> Result<(), SubmitError> {
        self.commands
            .send(Command::EnableReporting)
            .await
            .map_err(|_| SubmitError::Stopped)
    }

    /// Stops the actor. Backend transfers keep running and can be adopted
    /// by the next service.
    pub async fn shutdown(&self) -> Result<(), SubmitError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn submit_prepared(
        &self,
        byte_size: u64,
        content_type: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
        source: &Path,
        move_file: bool,
    ) -> Result<JobSnapshot, SubmitError> {
        let content_type = content_type.to_string();
        let metadata = metadata.clone();
        let source = source.to_path_buf();
        self.request(|reply| Command::Submit {
            byte_size,
            content_type,
            metadata,
            source,
            move_file,
            reply,
        })
        .await?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SubmitError::Stopped)?;
        rx.await.map_err(|_| SubmitError::Stopped)
    }
}

/// Runs blocking file work off the async threads.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> io::Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::other(e.to_string()))
}

/// Places the submitted file at `dest`, by rename when moving and
/// possible, by copy otherwise.
fn place_payload(source: &Path, dest: &Path, move_file: bool) -> io::Result<()> {
    if move_file {
        match std::fs::rename(source, dest) {
            Ok(()) => return Ok(()),
            Err(e) => debug!(error = %e, "rename failed, copying payload instead"),
        }
    }
    std::fs::copy(source, dest)?;
    if move_file {
        std::fs::remove_file(source)?;
    }
    Ok(())
}

/// Reverts [`place_payload`] after a refused commit.
fn undo_placement(source: PathBuf, dest: PathBuf, move_file: bool) {
    tokio::task::spawn_blocking(move || {
        let result = if move_file && !source.exists() {
            std::fs::rename(&dest, &source).or_else(|_| {
                std::fs::copy(&dest, &source).and_then(|_| std::fs::remove_file(&dest))
            })
        } else {
            std::fs::remove_file(&dest)
        };
        if let Err(e) = result
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(error = %e, "failed to revert payload placement");
        }
    });
}

struct Actor {
    config: UploaderConfig,
    session: Arc<dyn SessionProvider>,
    allocator: Arc<dyn CredentialAllocator>,
    backend: Arc<dyn TransferBackend>,
    platform: Arc<dyn Platform>,
    notifier: EventNotifier,
    transfer_tx: mpsc::UnboundedSender<TransferEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Bumped on every workspace change; offloaded work from an older
    /// generation is discarded.
    generation: u64,
    workspace: Option<Workspace>,
    jobs: HashMap<String, Job>,
    /// Unused credentials of the open workspace.
    pool: CredentialPool,
    /// Reserved jobs waiting for their payload.
    pending: HashMap<String, Job>,
    /// Ids whose payload is being placed, across workspace changes.
    placing: HashSet<String>,
    active: HashMap<String, Activity>,
    speeds: HashMap<String, SpeedCalculator>,
    /// Allocation round trips in flight, by content type.
    refilling: HashMap<String, Vec<oneshot::Sender<()>>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transfers: mpsc::UnboundedReceiver<TransferEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            // Events already queued are applied before later commands.
            tokio::select! {
                biased;
                Some(event) = transfers.recv() => self.on_transfer_event(event),
                Some(message) = internal.recv() => self.on_internal(message),
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
            }
        }
        debug!("upload service stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::OpenSession { reply } => self.open_session(reply),
            Command::CloseSession { reply } => {
                self.close_session();
                let _ = reply.send(());
            }
            Command::Submit {
                byte_size,
                content_type,
                metadata,
                source,
                move_file,
                reply,
            } => match self.reserve(byte_size, content_type, metadata) {
                Ok(reservation) => self.place(reservation, source, move_file, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Start { job_id, reply } => {
                let known = self.jobs.contains_key(&job_id);
                if known {
                    self.start_job(&job_id);
                }
                let _ = reply.send(known);
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel(&job_id));
            }
            Command::Acknowledge { job_id, reply } => {
                let done = self.jobs.get(&job_id).is_some_and(Job::is_completed);
                if done {
                    self.remove_job(&job_id);
                }
                let _ = reply.send(done);
            }
            Command::List { reply } => {
                let mut jobs: Vec<&Job> = self.jobs.values().collect();
                jobs.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(b.id())));
                let _ = reply.send(jobs.into_iter().map(|j| self.snapshot(j)).collect());
            }
            Command::Get { job_id, reply } => {
                let _ = reply.send(self.jobs.get(&job_id).map(|j| self.snapshot(j)));
            }
            Command::Refill {
                content_type,
                reply,
            } => self.request_refill(&content_type, Some(reply)),
            Command::EnableReporting => self.notifier.enable_reporting(),
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::WorkspaceOpened {
                generation,
                result,
                reply,
            } => {
                let _ = reply.send(self.install_workspace(generation, result));
            }
            Internal::ResumePrepared {
                generation,
                job_id,
                resume_from,
                result,
            } => self.on_resume_prepared(generation, &job_id, resume_from, result),
            Internal::Refilled {
                generation,
                content_type,
                result,
            } => self.on_refilled(generation, content_type, result),
            Internal::RetryDue { generation, job_id } => {
                if generation != self.generation || !self.jobs.contains_key(&job_id) {
                    return;
                }
                if self.active.contains_key(&job_id) {
                    debug!(job = %job_id, "transfer already running, dropping retry");
                    return;
                }
                self.start_job(&job_id);
            }
            Internal::Placed {
                reservation,
                source,
                move_file,
                placed,
                reply,
            } => {
                self.placing.remove(&reservation.job_id);
                let _ = reply.send(self.commit(reservation, source, move_file, placed));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Workspace
    // -----------------------------------------------------------------------

    fn open_session(&mut self, reply: oneshot::Sender<Result<usize, SubmitError>>) {
        let Some(account) = self.session.account_id() else {
            let _ = reply.send(Err(SubmitError::NoSession));
            return;
        };
        if self
            .workspace
            .as_ref()
            .is_some_and(|ws| ws.account_id() == account)
        {
            let _ = reply.send(Ok(self.jobs.len()));
            return;
        }

        self.close_session();
        let generation = self.generation;
        let root = self.config.storage_root.clone();
        let placing = self.placing.clone();
        let tx = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = Workspace::open(&root, &account).and_then(|ws| {
                let jobs = ws.store().scan_skipping(&placing)?;
                Ok((ws, jobs))
            });
            let _ = tx.send(Internal::WorkspaceOpened {
                generation,
                result,
                reply,
            });
        });
    }

    fn install_workspace(
        &mut self,
        generation: u64,
        result: Result<(Workspace, Vec<Job>), StoreError>,
    ) -> Result<usize, SubmitError> {
        if generation != self.generation {
            return Err(SubmitError::NoWorkspace);
        }
        let (mut workspace, jobs) = result?;

        let now = Utc::now();
        self.pool.clear();
        self.pool.absorb(workspace.take_cached_credentials(), now);
        self.jobs = jobs
            .into_iter()
            .map(|job| (job.id().to_string(), job))
            .collect();
        self.workspace = Some(workspace);
        info!(jobs = self.jobs.len(), "upload workspace opened");

        self.recover();
        Ok(self.jobs.len())
    }

    /// Adopts live backend transfers, then starts every pending job.
    fn recover(&mut self) {
        let plan = plan_recovery(&self.jobs, self.backend.outstanding());

        for (job_id, transfer) in plan.reattach {
            info!(job = %job_id, transfer, "re-attached running transfer");
            self.active.insert(job_id, Activity::Transfer(transfer));
        }
        for job_id in plan.orphaned {
            warn!(job = %job_id, "cancelling transfer with no pending job");
            self.backend.cancel(&job_id);
        }
        self.backend.attach(self.transfer_tx.clone());

        for job_id in plan.start {
            self.start_job(&job_id);
        }
        for job_id in plan.completed {
            if let Some(snapshot) = self.jobs.get(&job_id).and_then(Job::completed_snapshot) {
                self.notifier.completed(snapshot);
            }
        }
        self.notifier.background_work_finished();
    }

    /// Drops all state of the open workspace. In-flight transfers are
    /// cancelled, not paused.
    fn close_session(&mut self) {
        self.generation += 1;
        self.backend.detach();
        for (job_id, activity) in self.active.drain() {
            if let Activity::Transfer(_) = activity {
                self.backend.cancel(&job_id);
            }
        }
        for (_, waiters) in self.refilling.drain() {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        self.jobs.clear();
        // Reservations of this workspace give their credentials back; the
        // placements are undone when they report in.
        let returned: Vec<Credential> = self
            .pending
            .drain()
            .filter_map(|(_, mut job)| job.discard_credential())
            .collect();
        self.pool.absorb(returned, Utc::now());
        self.speeds.clear();
        self.notifier.forget_all();

        if let Some(workspace) = self.workspace.take() {
            self.prune_pool();
            self.save_pool_to(&workspace);
            self.pool.clear();
            info!("upload workspace closed");
        }
    }

    /// Stops delivery without touching running transfers.
    fn shutdown(&mut self) {
        self.backend.detach();
        self.save_pool();
        for (_, waiters) in self.refilling.drain() {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    fn reserve(
        &mut self,
        byte_size: u64,
        content_type: String,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Reservation, SubmitError> {
        if self.session.account_id().is_none() {
            return Err(SubmitError::NoSession);
        }
        let workspace = self.workspace.as_ref().ok_or(SubmitError::NoWorkspace)?;

        let mut job = workspace.store().create(byte_size, &content_type, metadata);
        let payload_path = workspace.store().payload_path(job.id());
        if self.pool.ensure(&mut job, Utc::now()) == EnsureOutcome::Unavailable {
            self.request_refill(&content_type, None);
            return Err(SubmitError::NoCredential);
        }

        let reservation = Reservation {
            job_id: job.id().to_string(),
            payload_path,
            generation: self.generation,
        };
        self.pending.insert(reservation.job_id.clone(), job);
        self.placing.insert(reservation.job_id.clone());
        self.save_pool();
        self.request_refill(&content_type, None);
        Ok(reservation)
    }

    /// Copies or moves the payload off the actor; [`Internal::Placed`]
    /// commits the job whether or not the submitter still waits.
    fn place(
        &self,
        reservation: Reservation,
        source: PathBuf,
        move_file: bool,
        reply: oneshot::Sender<Result<JobSnapshot, SubmitError>>,
    ) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let placed = {
                let source = source.clone();
                let dest = reservation.payload_path.clone();
                blocking(move || place_payload(&source, &dest, move_file))
                    .await
                    .and_then(|r| r)
            };
            let _ = tx.send(Internal::Placed {
                reservation,
                source,
                move_file,
                placed,
                reply,
            });
        });
    }

    fn commit(
        &mut self,
        reservation: Reservation,
        source: PathBuf,
        move_file: bool,
        placed: io::Result<()>,
    ) -> Result<JobSnapshot, SubmitError> {
        let Reservation {
            job_id,
            payload_path,
            generation,
        } = reservation;

        let job = (generation == self.generation)
            .then(|| self.pending.remove(&job_id))
            .flatten();
        let Some(mut job) = job else {
            if placed.is_ok() {
                undo_placement(source, payload_path, move_file);
            }
            return Err(SubmitError::NoWorkspace);
        };

        let persisted = match placed {
            Ok(()) => self.persist_job(&job),
            Err(e) => Err(SubmitError::Io(e)),
        };
        if let Err(e) = persisted {
            if let Some(credential) = job.discard_credential() {
                self.pool.absorb(vec![credential], Utc::now());
                self.save_pool();
            }
            undo_placement(source, payload_path, move_file);
            return Err(e);
        }

        info!(
            job = %job_id,
            bytes = job.byte_size(),
            content_type = job.content_type(),
            "upload queued"
        );
        let snapshot = job.snapshot();
        self.jobs.insert(job_id.clone(), job);
        self.start_job(&job_id);
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Start protocol
    // -----------------------------------------------------------------------

    fn start_job(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        match plan_start(job, self.active.contains_key(job_id)) {
            StartPlan::AlreadyActive => {
                debug!(job = %job_id, "transfer already in flight");
                return;
            }
            StartPlan::AlreadyCompleted => {
                if let Some(snapshot) = job.completed_snapshot() {
                    self.notifier.completed(snapshot);
                }
                return;
            }
            StartPlan::Proceed => {}
        }

        let Some(outcome) = self.ensure_credential(job_id) else {
            return;
        };
        let replaced = matches!(outcome, EnsureOutcome::Assigned { .. });
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        match opening(job, replaced) {
            Opening::Probe => self.begin_probe(job_id),
            Opening::Full => self.begin_full(job_id),
        }
    }

    /// Restarts from byte 0, skipping the probe.
    fn restart_full(&mut self, job_id: &str) {
        if self.ensure_credential(job_id).is_some() {
            self.begin_full(job_id);
        }
    }

    /// Runs the pool's `ensure` on a job. Returns `None` when the job is
    /// left without a credential.
    fn ensure_credential(&mut self, job_id: &str) -> Option<EnsureOutcome> {
        let job = self.jobs.get_mut(job_id)?;
        let outcome = self.pool.ensure(job, Utc::now());
        let content_type = job.content_type().to_string();

        match &outcome {
            EnsureOutcome::Kept => {}
            EnsureOutcome::Assigned { replaced } => {
                debug!(
                    job = %job_id,
                    rotated = replaced.is_some(),
                    "assigned upload credential"
                );
                self.persist(job_id);
                self.save_pool();
            }
            EnsureOutcome::Unavailable => {
                warn!(job = %job_id, "no upload credential available, job waits for a refill");
                self.persist(job_id);
                self.request_refill(&content_type, None);
                return None;
            }
        }
        self.request_refill(&content_type, None);
        Some(outcome)
    }

    fn begin_full(&mut self, job_id: &str) {
        let Some(workspace) = &self.workspace else {
            return;
        };
        let payload = workspace.store().payload_path(job_id);
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let Some(credential) = job.credential().cloned() else {
            error!(job = %job_id, "full send requested without a credential");
            return;
        };

        job.rewind();
        let request = TransferRequest::full(
            job_id,
            &credential.transfer_url,
            job.content_type(),
            payload,
            job.byte_size(),
        );
        if let Some(speed) = self.speeds.get_mut(job_id) {
            speed.reset();
        }
        self.launch(job_id, request, Some(credential));
    }

    fn begin_probe(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let Some(credential) = job.credential() else {
            error!(job = %job_id, "probe requested without a credential");
            return;
        };
        debug!(job = %job_id, "probing remote for resume point");
        let request = TransferRequest::probe(
            job_id,
            &credential.transfer_url,
            job.content_type(),
            job.byte_size(),
        );
        self.launch(job_id, request, None);
    }

    /// Hands a request to the backend and marks the job active.
    fn launch(&mut self, job_id: &str, request: TransferRequest, announce: Option<Credential>) {
        match self.backend.begin(request) {
            Ok(transfer) => {
                self.active
                    .insert(job_id.to_string(), Activity::Transfer(transfer));
                if let (Some(credential), Some(job)) = (announce, self.jobs.get(job_id)) {
                    self.notifier
                        .transfer_started(self.snapshot(job), credential);
                }
            }
            Err(BackendError::AlreadyActive(_)) => {
                error!(job = %job_id, "backend already runs an untracked transfer, replacing it");
                self.backend.cancel(job_id);
                self.schedule_retry(job_id);
            }
            Err(e) => {
                warn!(job = %job_id, error = %e, "could not start transfer");
                self.schedule_retry(job_id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transfer events
    // -----------------------------------------------------------------------

    fn on_transfer_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::BytesSent {
                job_id,
                transfer,
                total_sent,
            } => {
                if self.is_current(&job_id, transfer) {
                    self.on_progress(&job_id, total_sent);
                }
            }
            TransferEvent::Finished {
                job_id,
                transfer,
                result,
            } => {
                if !self.is_current(&job_id, transfer) {
                    return;
                }
                self.active.remove(&job_id);
                match result {
                    Ok(response) => self.on_response(&job_id, response),
                    Err(e) => self.on_transport_failure(&job_id, e),
                }
            }
        }
    }

    /// Returns `true` if the event belongs to the job's current transfer.
    fn is_current(&self, job_id: &str, transfer: u64) -> bool {
        match self.active.get(job_id) {
            Some(Activity::Transfer(current)) if *current == transfer => true,
            Some(_) => {
                debug!(job = %job_id, transfer, "dropping event of a superseded transfer");
                false
            }
            None if self.jobs.contains_key(job_id) => {
                debug!(job = %job_id, transfer, "dropping event of a finished transfer");
                false
            }
            None => {
                error!(job = %job_id, transfer, "transfer event for unknown job dropped");
                false
            }
        }
    }

    fn on_progress(&mut self, job_id: &str, total_sent: u64) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let delta = total_sent.saturating_sub(job.bytes_sent());
        let first_byte = job.mark_started(Utc::now());
        job.record_progress(total_sent);

        let speed = self.speeds.entry(job_id.to_string()).or_default();
        speed.add_sample(delta);
        let snapshot = job.snapshot().with_speed(speed);

        if first_byte {
            self.persist(job_id);
        }
        self.notifier.progress(snapshot);
    }

    fn on_response(&mut self, job_id: &str, response: TransferResponse) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let verdict = judge(&response, job.byte_size());
        debug!(job = %job_id, status = response.status, ?verdict, "transfer answered");

        match verdict {
            Verdict::Complete => self.complete_job(job_id),
            Verdict::Resume { from } => self.prepare_resume(job_id, from),
            Verdict::BadRange(e) => {
                error!(
                    job = %job_id,
                    error = %e,
                    "unusable resume point, job stays idle until started again"
                );
            }
            Verdict::RestartSession => {
                info!(
                    job = %job_id,
                    status = response.status,
                    "remote lost the upload session, restarting"
                );
                job.rewind();
                self.restart_full(job_id);
            }
            Verdict::RestartForbidden => {
                warn!(job = %job_id, "credential rejected, restarting with a new one");
                if let Some(credential) = job.discard_credential() {
                    self.pool.discard(&credential.id);
                }
                job.note_restart();
                self.persist(job_id);
                self.restart_full(job_id);
            }
            Verdict::RestartUnexpected(status) => {
                job.note_restart();
                warn!(
                    job = %job_id,
                    status,
                    attempt = job.restart_count(),
                    "unexpected response, restarting"
                );
                self.persist(job_id);
                self.restart_full(job_id);
            }
        }
    }

    fn on_transport_failure(&mut self, job_id: &str, error: BackendError) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        job.note_restart();
        warn!(
            job = %job_id,
            error = %error,
            attempt = job.restart_count(),
            retry_in = ?self.config.retry_delay(),
            "transfer failed, retrying"
        );
        self.persist(job_id);
        self.schedule_retry(job_id);
    }

    /// Re-runs the start protocol after the retry delay, under a
    /// background activity so a brief suspension does not lose it.
    fn schedule_retry(&mut self, job_id: &str) {
        let activity = self.platform.begin_background_activity("upload retry");
        let delay = self.config.retry_delay();
        let generation = self.generation;
        let tx = self.internal_tx.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let _activity = activity;
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::RetryDue { generation, job_id });
        });
    }

    fn prepare_resume(&mut self, job_id: &str, resume_from: u64) {
        let Some(workspace) = &self.workspace else {
            return;
        };
        let payload = workspace.store().payload_path(job_id);
        let tail = workspace.store().resume_path(job_id);
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };

        info!(job = %job_id, resume_from, total = job.byte_size(), "resuming upload");
        job.record_progress(resume_from);
        self.active.insert(job_id.to_string(), Activity::Preparing);

        let generation = self.generation;
        let tx = self.internal_tx.clone();
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || {
            let result = write_resume_tail(&payload, &tail, resume_from);
            let _ = tx.send(Internal::ResumePrepared {
                generation,
                job_id,
                resume_from,
                result,
            });
        });
    }

    fn on_resume_prepared(
        &mut self,
        generation: u64,
        job_id: &str,
        resume_from: u64,
        result: Result<u64, TransferError>,
    ) {
        if generation != self.generation {
            return;
        }
        if self.active.get(job_id) != Some(&Activity::Preparing) {
            // Cancelled while slicing.
            if !self.jobs.contains_key(job_id)
                && let Some(workspace) = &self.workspace
                && let Err(e) = workspace.store().delete_resume(job_id)
            {
                self.log_store_error(job_id, "failed to remove stale resume file", &e);
            }
            return;
        }
        self.active.remove(job_id);

        let tail_len = match result {
            Ok(len) => len,
            Err(e) => {
                let message = self.redactor(job_id).redact(&e.to_string());
                warn!(error = %message, "could not slice resume tail, restarting");
                self.restart_full(job_id);
                return;
            }
        };

        let Some(workspace) = &self.workspace else {
            return;
        };
        let tail = workspace.store().resume_path(job_id);
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let Some(credential) = job.credential().cloned() else {
            error!(job = %job_id, "resume requested without a credential");
            return;
        };
        debug!(job = %job_id, tail_len, "sending resume tail");
        let request = TransferRequest::resume(
            job_id,
            &credential.transfer_url,
            job.content_type(),
            tail,
            resume_from,
            job.byte_size(),
        );
        self.launch(job_id, request, Some(credential));
    }

    fn complete_job(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let snapshot = match job.complete(Utc::now()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(job = %job_id, error = %e, "cannot complete job");
                return;
            }
        };

        self.speeds.remove(job_id);
        self.persist(job_id);
        if let Some(workspace) = &self.workspace
            && let Err(e) = workspace.store().delete_payload(job_id)
        {
            self.log_store_error(job_id, "failed to remove uploaded payload", &e);
        }
        info!(job = %job_id, bytes = snapshot.byte_size, "upload completed");
        self.notifier.completed(snapshot);
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    fn cancel(&mut self, job_id: &str) -> bool {
        if !self.jobs.contains_key(job_id) {
            return false;
        }
        if let Some(Activity::Transfer(_)) = self.active.get(job_id) {
            self.backend.cancel(job_id);
        }
        info!(job = %job_id, "upload cancelled");
        self.remove_job(job_id);
        true
    }

    fn remove_job(&mut self, job_id: &str) {
        self.active.remove(job_id);
        self.speeds.remove(job_id);
        self.notifier.forget(job_id);
        self.jobs.remove(job_id);
        if let Some(workspace) = &self.workspace
            && let Err(e) = workspace.store().delete(job_id)
        {
            self.log_store_error(job_id, "failed to delete job files", &e);
        }
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    /// Starts an allocation round trip for `content_type` if the cache is
    /// low and none is in flight. `waiter` is answered when it ends.
    fn request_refill(&mut self, content_type: &str, waiter: Option<oneshot::Sender<()>>) {
        if let Some(waiters) = self.refilling.get_mut(content_type) {
            waiters.extend(waiter);
            return;
        }
        self.prune_pool();
        if self.workspace.is_none() || !self.pool.needs_refill(content_type, Utc::now()) {
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
            return;
        }

        self.refilling
            .insert(content_type.to_string(), waiter.into_iter().collect());

        let allocator = self.allocator.clone();
        let count = self.config.allocation_batch;
        let generation = self.generation;
        let tx = self.internal_tx.clone();
        let content_type = content_type.to_string();
        debug!(%content_type, count, "requesting upload credentials");
        tokio::spawn(async move {
            let result = allocator.allocate(&content_type, count).await;
            let _ = tx.send(Internal::Refilled {
                generation,
                content_type,
                result,
            });
        });
    }

    fn on_refilled(
        &mut self,
        generation: u64,
        content_type: String,
        result: Result<Vec<Credential>, CredentialError>,
    ) {
        if generation != self.generation {
            return;
        }
        let waiters = self.refilling.remove(&content_type).unwrap_or_default();

        match result {
            Ok(batch) => {
                let added = self.pool.absorb(batch, Utc::now());
                debug!(%content_type, added, cached = self.pool.len(), "credential cache refilled");
                if added > 0 {
                    self.save_pool();
                    self.start_waiting_jobs(&content_type);
                }
            }
            Err(e) => warn!(%content_type, error = %e, "credential allocation failed"),
        }

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Starts idle jobs that were left without a credential.
    fn start_waiting_jobs(&mut self, content_type: &str) {
        let mut waiting: Vec<&Job> = self
            .jobs
            .values()
            .filter(|job| {
                !job.is_completed()
                    && job.credential().is_none()
                    && job.content_type().eq_ignore_ascii_case(content_type)
                    && !self.active.contains_key(job.id())
            })
            .collect();
        waiting.sort_by_key(|job| job.created_at());
        let ids: Vec<String> = waiting.iter().map(|job| job.id().to_string()).collect();

        for job_id in ids {
            self.start_job(&job_id);
        }
    }

    fn prune_pool(&mut self) {
        let dropped = self.pool.prune(Utc::now());
        if dropped > 0 {
            debug!(dropped, "dropped expired credentials");
        }
    }

    /// Writes the pruned cache to the open workspace, if any.
    fn save_pool(&mut self) {
        self.prune_pool();
        if let Some(workspace) = &self.workspace {
            self.save_pool_to(workspace);
        }
    }

    fn save_pool_to(&self, workspace: &Workspace) {
        if let Err(e) = workspace.save_info(self.pool.credentials(), &self.config.build_tag) {
            let message = Redactor::new()
                .account(workspace.account_id(), workspace.dir_name())
                .redact(&e.to_string());
            warn!(error = %message, "failed to write workspace info");
        }
    }

    // -----------------------------------------------------------------------
    // Persistence and logging
    // -----------------------------------------------------------------------

    /// Persists a job. Failures are logged; memory stays authoritative and
    /// the next successful write catches the file up.
    fn persist(&self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        if let Err(e) = self.persist_job(job) {
            let message = self.redactor(job_id).redact(&e.to_string());
            warn!(error = %message, "failed to persist job");
        }
    }

    fn persist_job(&self, job: &Job) -> Result<(), SubmitError> {
        let workspace = self.workspace.as_ref().ok_or(SubmitError::NoWorkspace)?;
        workspace.store().persist(job)?;
        Ok(())
    }

    fn log_store_error(&self, job_id: &str, what: &str, error: &StoreError) {
        let message = self.redactor(job_id).redact(&error.to_string());
        warn!(error = %message, "{what}");
    }

    fn redactor(&self, job_id: &str) -> Redactor {
        let mut redactor = Redactor::new().job(job_id);
        if let Some(credential) = self.jobs.get(job_id).and_then(Job::credential) {
            redactor = redactor.credential(&credential.id);
        }
        if let Some(workspace) = &self.workspace {
            redactor = redactor.account(workspace.account_id(), workspace.dir_name());
        }
        redactor
    }

    fn snapshot(&self, job: &Job) -> JobSnapshot {
        match self.speeds.get(job.id()) {
            Some(speed) => job.snapshot().with_speed(speed),
            None => job.snapshot(),
        }
    }
}
