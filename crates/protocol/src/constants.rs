use std::time::Duration;

/// Schema version written into every job metadata file.
pub const JOB_SCHEMA_VERSION: u32 = 1;

/// Restart count above which a job's credential is rotated.
pub const RESTART_THRESHOLD: u32 = 2;

/// Minimum remaining lifetime for a credential to be used at all.
pub const USABLE_MARGIN: Duration = Duration::from_secs(60 * 60);

/// Remaining lifetime for a credential to count as fresh.
///
/// Fresh credentials are preferred when a job is restarted so that a long
/// transfer does not run into the expiry halfway through.
pub const FRESH_MARGIN: Duration = Duration::from_secs(24 * 60 * 60);

/// Refill the credential cache when fewer usable entries remain.
pub const LOW_WATER_MARK: usize = 10;

/// Credentials requested per allocation round trip.
pub const DEFAULT_ALLOCATION_BATCH: usize = 20;

/// Delay before retrying a job whose connection dropped.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Suffix of job metadata files inside a workspace.
pub const JOB_FILE_SUFFIX: &str = ".job.json";

/// Suffix of payload copies inside a workspace.
pub const PAYLOAD_FILE_SUFFIX: &str = ".payload";

/// Suffix of partial-resume tail files inside a workspace.
pub const RESUME_FILE_SUFFIX: &str = ".resume";

/// Suffix used for write-then-rename temp files.
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Name of the per-workspace info file caching unused credentials.
pub const WORKSPACE_INFO_FILE: &str = "workspace.json";

/// Content type used when none is declared and none can be detected.
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
