//! Records and wire helpers shared by every Skyhaul crate.
//!
//! The types here describe what lands on disk (job metadata files and the
//! workspace info file) and how upload requests talk to remote storage
//! (`Content-Range` / `Range` headers).

pub mod constants;
pub mod range;
pub mod types;

// Re-export primary types for convenience.
pub use range::{RangeError, content_range, parse_range_header, probe_content_range};
pub use types::{Credential, JobRecord, WorkspaceInfo};
