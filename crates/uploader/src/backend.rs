//! Network transport for uploads.
//!
//! A [`TransferBackend`] runs `PUT` requests in the background and reports
//! progress and results through an event sink. The backend is owned by
//! the host and can outlive an [`crate::UploadService`]: transfers keep
//! running while no service is attached, their results are held, and a new
//! service adopts them by job id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::Stream;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use skyhaul_protocol::{content_range, probe_content_range};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bytes read from disk per body chunk.
pub const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

/// Errors from the transport.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a transfer is already running for job {0}")]
    AlreadyActive(String),
}

/// Request body of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferBody {
    /// Zero-length body (resume probe).
    Empty,
    /// The whole of a file on disk.
    File { path: PathBuf, len: u64 },
}

/// One `PUT` to a credential's transfer URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub job_id: String,
    pub url: String,
    pub content_type: String,
    pub body: TransferBody,
    pub content_range: Option<String>,
    /// Bytes the remote already holds; progress counts up from here.
    pub offset: u64,
}

impl TransferRequest {
    /// Sends the whole payload from byte 0.
    pub fn full(
        job_id: &str,
        url: &str,
        content_type: &str,
        payload: PathBuf,
        total: u64,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            url: url.to_string(),
            content_type: content_type.to_string(),
            body: TransferBody::File {
                path: payload,
                len: total,
            },
            content_range: None,
            offset: 0,
        }
    }

    /// Asks the remote how many bytes of `total` it holds.
    pub fn probe(job_id: &str, url: &str, content_type: &str, total: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            url: url.to_string(),
            content_type: content_type.to_string(),
            body: TransferBody::Empty,
            content_range: Some(probe_content_range(total)),
            offset: 0,
        }
    }

    /// Sends the tail file holding bytes `resume_from..total`.
    pub fn resume(
        job_id: &str,
        url: &str,
        content_type: &str,
        tail: PathBuf,
        resume_from: u64,
        total: u64,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            url: url.to_string(),
            content_type: content_type.to_string(),
            body: TransferBody::File {
                path: tail,
                len: total - resume_from,
            },
            content_range: Some(content_range(resume_from, total - 1, total)),
            offset: resume_from,
        }
    }

    /// Number of body bytes.
    pub fn body_len(&self) -> u64 {
        match &self.body {
            TransferBody::Empty => 0,
            TransferBody::File { len, .. } => *len,
        }
    }
}

/// What the remote answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResponse {
    pub status: u16,
    /// Raw `Range` header, if any.
    pub range: Option<String>,
}

/// Reported by a backend while transfers run.
#[derive(Debug)]
pub enum TransferEvent {
    /// `total_sent` counts from byte 0 of the payload, including the offset.
    BytesSent {
        job_id: String,
        transfer: u64,
        total_sent: u64,
    },
    /// The transfer ended with a response or a transport failure.
    Finished {
        job_id: String,
        transfer: u64,
        result: Result<TransferResponse, BackendError>,
    },
}

impl TransferEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::BytesSent { job_id, .. } | Self::Finished { job_id, .. } => job_id,
        }
    }
}

/// Where a backend delivers events.
pub type EventSink = mpsc::UnboundedSender<TransferEvent>;

/// Background transport for upload requests.
pub trait TransferBackend: Send + Sync {
    /// Routes events to `sink`, first delivering results held while detached.
    fn attach(&self, sink: EventSink);

    /// Stops delivering events. Transfers keep running.
    fn detach(&self);

    /// Starts a transfer and returns its id.
    ///
    /// Fails with [`BackendError::AlreadyActive`] if the job already has one.
    fn begin(&self, request: TransferRequest) -> Result<u64, BackendError>;

    /// Transfers still running or holding an undelivered result, as
    /// `(job id, transfer id)`.
    fn outstanding(&self) -> Vec<(String, u64)>;

    /// Cancels the job's transfer. No event is reported for it afterwards.
    fn cancel(&self, job_id: &str) -> bool;
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    running: HashMap<String, (u64, CancellationToken)>,
    sink: Option<EventSink>,
    /// Results that finished while detached.
    held: Vec<TransferEvent>,
}

impl Registry {
    fn emit(&mut self, event: TransferEvent) {
        let event = match &self.sink {
            Some(sink) => match sink.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    self.sink = None;
                    event
                }
            },
            None => event,
        };
        if matches!(event, TransferEvent::Finished { .. }) {
            self.held.push(event);
        }
    }

    /// Removes the job's entry if it still belongs to `transfer`.
    fn finish(&mut self, job_id: &str, transfer: u64) -> bool {
        let current = self
            .running
            .get(job_id)
            .is_some_and(|(id, _)| *id == transfer);
        if current {
            self.running.remove(job_id);
        }
        current
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// [`TransferBackend`] over reqwest with streamed file bodies.
pub struct HttpBackend {
    http: reqwest::Client,
    registry: Arc<Mutex<Registry>>,
}

impl HttpBackend {
    pub fn new() -> Result<Self, BackendError> {
        Ok(Self::with_client(reqwest::Client::builder().build()?))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }
}

impl TransferBackend for HttpBackend {
    fn attach(&self, sink: EventSink) {
        let mut registry = lock(&self.registry);
        registry.sink = Some(sink);
        let held = std::mem::take(&mut registry.held);
        if !held.is_empty() {
            debug!(count = held.len(), "delivering transfer results held while detached");
        }
        for event in held {
            registry.emit(event);
        }
    }

    fn detach(&self) {
        lock(&self.registry).sink = None;
    }

    fn begin(&self, request: TransferRequest) -> Result<u64, BackendError> {
        let token = CancellationToken::new();
        let transfer = {
            let mut registry = lock(&self.registry);
            if registry.running.contains_key(&request.job_id) {
                return Err(BackendError::AlreadyActive(request.job_id));
            }
            registry.next_id += 1;
            let transfer = registry.next_id;
            registry
                .running
                .insert(request.job_id.clone(), (transfer, token.clone()));
            transfer
        };

        let http = self.http.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let job_id = request.job_id.clone();
            let result = tokio::select! {
                _ = token.cancelled() => {
                    debug!(job = %job_id, transfer, "transfer cancelled");
                    return;
                }
                result = send(&http, request, transfer, &registry) => result,
            };

            let mut registry = lock(&registry);
            if registry.finish(&job_id, transfer) {
                registry.emit(TransferEvent::Finished {
                    job_id,
                    transfer,
                    result,
                });
            }
        });

        Ok(transfer)
    }

    fn outstanding(&self) -> Vec<(String, u64)> {
        let registry = lock(&self.registry);
        let running = registry
            .running
            .iter()
            .map(|(job_id, (transfer, _))| (job_id.clone(), *transfer));
        let held = registry.held.iter().filter_map(|event| match event {
            TransferEvent::Finished {
                job_id, transfer, ..
            } => Some((job_id.clone(), *transfer)),
            TransferEvent::BytesSent { .. } => None,
        });
        running.chain(held).collect()
    }

    fn cancel(&self, job_id: &str) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.held.len();
        registry.held.retain(|event| event.job_id() != job_id);
        let dropped_held = registry.held.len() != before;

        match registry.running.remove(job_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => dropped_held,
        }
    }
}

async fn send(
    http: &reqwest::Client,
    request: TransferRequest,
    transfer: u64,
    registry: &Arc<Mutex<Registry>>,
) -> Result<TransferResponse, BackendError> {
    let body_len = request.body_len();
    let TransferRequest {
        job_id,
        url,
        content_type,
        body,
        content_range,
        offset,
    } = request;

    let mut builder = http
        .put(&url)
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_LENGTH, body_len);
    if let Some(range) = content_range {
        builder = builder.header(CONTENT_RANGE, range);
    }

    builder = match body {
        TransferBody::Empty => builder.body(Vec::new()),
        TransferBody::File { path, .. } => {
            let file = tokio::fs::File::open(&path).await?;
            let stream = progress_stream(file, job_id, transfer, offset, registry.clone());
            builder.body(reqwest::Body::wrap_stream(stream))
        }
    };

    let resp = builder.send().await?;
    let range = resp
        .headers()
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(TransferResponse {
        status: resp.status().as_u16(),
        range,
    })
}

/// Streams `file` in chunks, reporting the running total after each one.
fn progress_stream(
    file: tokio::fs::File,
    job_id: String,
    transfer: u64,
    offset: u64,
    registry: Arc<Mutex<Registry>>,
) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send + Sync + 'static {
    futures_util::stream::try_unfold((file, offset), move |(mut file, sent)| {
        let job_id = job_id.clone();
        let registry = registry.clone();
        async move {
            let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);

            let total_sent = sent + n as u64;
            trace!(job = %job_id, total_sent, "chunk handed to transport");
            lock(&registry).emit(TransferEvent::BytesSent {
                job_id,
                transfer,
                total_sent,
            });
            Ok(Some((buf, (file, total_sent))))
        }
    })
}
