//! Scripted collaborators for driving the upload service in tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use skyhaul_credentials::{AllocateFuture, CredentialAllocator};
use skyhaul_uploader::backend::EventSink;
use skyhaul_uploader::{
    BackendError, Credential, NoopPlatform, StaticSession, TransferBackend, TransferEvent,
    TransferRequest, TransferResponse, UploadEvent, UploadService, UploaderConfig,
};
use skyhaul_workspace::{JobStore, workspace_dir_name};
use tokio::sync::mpsc;

pub const ACCOUNT: &str = "account-1";

#[derive(Default)]
struct BackendState {
    next_id: u64,
    sink: Option<EventSink>,
    running: HashMap<String, u64>,
    held: Vec<TransferEvent>,
    requests: Vec<TransferRequest>,
    cancelled: Vec<String>,
    refused: usize,
}

/// Transfer backend whose transfers only finish when the test says so.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.lock().requests.clone()
    }

    pub fn requests_for(&self, job_id: &str) -> Vec<TransferRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    pub fn refused(&self) -> usize {
        self.lock().refused
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.lock().running.contains_key(job_id)
    }

    /// Registers a transfer that outlived a previous process.
    pub fn preload(&self, job_id: &str) -> u64 {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.running.insert(job_id.to_string(), id);
        id
    }

    /// Drops a running transfer without reporting anything.
    pub fn lose(&self, job_id: &str) {
        self.lock().running.remove(job_id);
    }

    pub fn progress(&self, job_id: &str, total_sent: u64) {
        let mut state = self.lock();
        let transfer = state.running[job_id];
        let event = TransferEvent::BytesSent {
            job_id: job_id.to_string(),
            transfer,
            total_sent,
        };
        emit(&mut state, event);
    }

    pub fn finish(&self, job_id: &str, status: u16, range: Option<&str>) {
        let response = TransferResponse {
            status,
            range: range.map(str::to_string),
        };
        self.end(job_id, Ok(response));
    }

    pub fn fail(&self, job_id: &str) {
        let error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
        self.end(job_id, Err(BackendError::Io(error)));
    }

    fn end(&self, job_id: &str, result: Result<TransferResponse, BackendError>) {
        let mut state = self.lock();
        let transfer = state
            .running
            .remove(job_id)
            .unwrap_or_else(|| panic!("no transfer running for {job_id}"));
        let event = TransferEvent::Finished {
            job_id: job_id.to_string(),
            transfer,
            result,
        };
        emit(&mut state, event);
    }
}

fn emit(state: &mut BackendState, event: TransferEvent) {
    match &state.sink {
        Some(sink) => {
            let _ = sink.send(event);
        }
        None => {
            if matches!(event, TransferEvent::Finished { .. }) {
                state.held.push(event);
            }
        }
    }
}

impl TransferBackend for FakeBackend {
    fn attach(&self, sink: EventSink) {
        let mut state = self.lock();
        for event in std::mem::take(&mut state.held) {
            let _ = sink.send(event);
        }
        state.sink = Some(sink);
    }

    fn detach(&self) {
        self.lock().sink = None;
    }

    fn begin(&self, request: TransferRequest) -> Result<u64, BackendError> {
        let mut state = self.lock();
        if state.running.contains_key(&request.job_id) {
            state.refused += 1;
            return Err(BackendError::AlreadyActive(request.job_id));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.running.insert(request.job_id.clone(), id);
        state.requests.push(request);
        Ok(id)
    }

    fn outstanding(&self) -> Vec<(String, u64)> {
        self.lock()
            .running
            .iter()
            .map(|(job, id)| (job.clone(), *id))
            .collect()
    }

    fn cancel(&self, job_id: &str) -> bool {
        let mut state = self.lock();
        let found = state.running.remove(job_id).is_some();
        state.cancelled.push(job_id.to_string());
        found
    }
}

/// Allocator handing out pre-scripted batches, then empty ones.
#[derive(Default)]
pub struct FakeAllocator {
    batches: Mutex<VecDeque<Vec<Credential>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeAllocator {
    pub fn with_batches(batches: Vec<Vec<Credential>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, batch: Vec<Credential>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CredentialAllocator for FakeAllocator {
    fn allocate<'a>(&'a self, content_type: &'a str, _count: usize) -> AllocateFuture<'a> {
        self.calls.lock().unwrap().push(content_type.to_string());
        let batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
        Box::pin(async move { Ok(batch) })
    }
}

pub fn credential(id: &str, hours: i64, resumable: bool) -> Credential {
    credential_for("video/mp4", id, hours, resumable)
}

pub fn credential_for(content_type: &str, id: &str, hours: i64, resumable: bool) -> Credential {
    Credential {
        id: id.into(),
        transfer_url: format!("https://storage.example.com/upload/{id}"),
        public_url: format!("https://cdn.example.com/{id}"),
        content_type: content_type.into(),
        expires_at: Utc::now() + TimeDelta::hours(hours),
        provider: "gcs".into(),
        resumable,
    }
}

pub fn config(root: &Path) -> UploaderConfig {
    UploaderConfig {
        storage_root: root.to_path_buf(),
        low_water_mark: 1,
        retry_delay_secs: 0,
        ..UploaderConfig::default()
    }
}

pub fn store(root: &Path) -> JobStore {
    JobStore::new(root.join(workspace_dir_name(ACCOUNT)))
}

/// Writes a source file whose bytes encode their own offset.
pub fn source_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

pub struct Harness {
    pub service: UploadService,
    pub events: mpsc::UnboundedReceiver<UploadEvent>,
    pub backend: Arc<FakeBackend>,
    pub allocator: Arc<FakeAllocator>,
    pub session: Arc<StaticSession>,
}

impl Harness {
    /// Spawns a service with reporting enabled and the session open.
    pub async fn open(root: &Path, backend: Arc<FakeBackend>, allocator: FakeAllocator) -> Self {
        let harness = Self::spawn(root, backend, allocator);
        harness.service.enable_reporting().await.unwrap();
        harness.service.open_session().await.unwrap();
        harness
    }

    pub fn spawn(root: &Path, backend: Arc<FakeBackend>, allocator: FakeAllocator) -> Self {
        Self::spawn_with(config(root), backend, allocator)
    }

    pub fn spawn_with(
        config: UploaderConfig,
        backend: Arc<FakeBackend>,
        allocator: FakeAllocator,
    ) -> Self {
        let session = Arc::new(StaticSession::new(Some(ACCOUNT.to_string())));
        let allocator = Arc::new(allocator);
        let service = UploadService::spawn(
            config,
            session.clone(),
            allocator.clone(),
            backend.clone(),
            Arc::new(NoopPlatform),
        );
        let events = service.take_events().unwrap();
        Self {
            service,
            events,
            backend,
            allocator,
            session,
        }
    }

    /// Waits for the first event matching `pred`, skipping others.
    pub async fn next_event(&mut self, pred: impl Fn(&UploadEvent) -> bool) -> UploadEvent {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Collects events already delivered without waiting.
    pub fn drain_events(&mut self) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Waits until the backend has seen `count` requests for `job_id`.
    pub async fn wait_for_requests(&self, job_id: &str, count: usize) {
        wait_until(|| self.backend.requests_for(job_id).len() >= count).await;
    }
}

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn is_completed(event: &UploadEvent) -> bool {
    matches!(event, UploadEvent::Completed(_))
}
