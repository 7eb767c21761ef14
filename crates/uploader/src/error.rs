use skyhaul_transfer::TransferError;
use skyhaul_workspace::StoreError;

/// Why a submission (or session operation) was refused.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("source file does not exist: {0}")]
    SourceMissing(String),

    #[error("source is not a local file: {0}")]
    NotLocal(String),

    #[error("no account is signed in")]
    NoSession,

    #[error("upload workspace is not open")]
    NoWorkspace,

    #[error("no upload credential available")]
    NoCredential,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("upload service has stopped")]
    Stopped,
}

impl From<TransferError> for SubmitError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::SourceMissing(p) => Self::SourceMissing(p),
            TransferError::NotLocal(p) => Self::NotLocal(p),
            TransferError::NoCredential(_) => Self::NoCredential,
            TransferError::Io(e) => Self::Io(e),
            other => Self::Store(StoreError::InvalidJob(other)),
        }
    }
}

/// Errors from loading or validating [`crate::UploaderConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
