//! Short-lived upload credentials.
//!
//! [`CredentialPool`] caches credentials and decides when a job needs a
//! new one; a [`CredentialAllocator`] fetches fresh batches from the
//! remote endpoint.

mod allocator;
mod pool;

pub use allocator::{AllocateFuture, CredentialAllocator, DisabledAllocator, HttpAllocator};
pub use pool::{CredentialPool, EnsureOutcome, PoolConfig};

/// Errors from credential allocation.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("allocation endpoint returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid allocation token")]
    InvalidToken,
}
