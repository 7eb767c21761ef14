//! Durable storage for upload jobs.
//!
//! Every account gets its own workspace directory holding one metadata
//! file per job, the payload copies, partial-resume tails, and a small
//! info file caching unused credentials.

mod paths;
mod store;
mod workspace;

pub use paths::{config_dir, data_dir, default_storage_root, workspace_dir_name};
pub use store::{JobStore, write_atomic};
pub use workspace::{Workspace, migrate_legacy};

/// Errors from workspace and job store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid job: {0}")]
    InvalidJob(#[from] skyhaul_transfer::TransferError),

    #[error("account id is empty")]
    EmptyAccount,
}
