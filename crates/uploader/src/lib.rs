//! Resumable background upload service.
//!
//! [`UploadService`] owns every job of the signed-in account. All state
//! lives in one actor task; network callbacks and disk work report back to
//! it over channels, so bookkeeping needs no locks.

pub mod backend;
pub mod config;
mod controller;
mod error;
pub mod events;
pub mod platform;
mod recovery;
pub mod redact;
mod service;

pub use backend::{
    BackendError, HttpBackend, TransferBackend, TransferBody, TransferEvent, TransferRequest,
    TransferResponse,
};
pub use config::UploaderConfig;
pub use error::{ConfigError, SubmitError};
pub use events::UploadEvent;
pub use platform::{BackgroundActivity, NoopPlatform, Platform, SessionProvider, StaticSession};
pub use service::{Submission, UploadService};

pub use skyhaul_protocol::Credential;
pub use skyhaul_transfer::{CompletedJob, JobSnapshot};
