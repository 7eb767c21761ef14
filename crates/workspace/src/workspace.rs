use std::path::{Path, PathBuf};

use chrono::Utc;
use skyhaul_protocol::constants::{
    JOB_FILE_SUFFIX, PAYLOAD_FILE_SUFFIX, RESUME_FILE_SUFFIX, WORKSPACE_INFO_FILE,
};
use skyhaul_protocol::{Credential, WorkspaceInfo};
use tracing::{debug, info, warn};

use crate::paths::workspace_dir_name;
use crate::store::{JobStore, write_atomic};
use crate::StoreError;

/// The storage directory of one account.
///
/// Only one workspace is open at a time; the owner drops the old one
/// before opening the next.
#[derive(Debug)]
pub struct Workspace {
    account_id: String,
    dir_name: String,
    store: JobStore,
    cached_credentials: Vec<Credential>,
}

impl Workspace {
    /// Opens (creating if needed) the workspace of `account_id` under `root`.
    ///
    /// Legacy job files sitting directly in `root` are migrated first, and
    /// the info file is loaded if present.
    pub fn open(root: &Path, account_id: &str) -> Result<Self, StoreError> {
        if account_id.is_empty() {
            return Err(StoreError::EmptyAccount);
        }

        let dir_name = workspace_dir_name(account_id);
        let dir = root.join(&dir_name);
        std::fs::create_dir_all(&dir)?;

        let moved = migrate_legacy(root, &dir)?;
        if moved > 0 {
            info!(files = moved, "migrated legacy upload files into workspace");
        }

        let cached_credentials = load_info(&dir.join(WORKSPACE_INFO_FILE))
            .map(|info| info.credentials)
            .unwrap_or_default();
        debug!(
            credentials = cached_credentials.len(),
            "opened upload workspace"
        );

        Ok(Self {
            account_id: account_id.to_string(),
            dir_name,
            store: JobStore::new(dir),
            cached_credentials,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Hashed directory name, as it appears on disk.
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Hands out the credentials loaded from the info file, once.
    pub fn take_cached_credentials(&mut self) -> Vec<Credential> {
        std::mem::take(&mut self.cached_credentials)
    }

    /// Rewrites the info file with the current unused credentials.
    pub fn save_info(&self, credentials: &[Credential], build: &str) -> Result<(), StoreError> {
        let info = WorkspaceInfo {
            updated_at: Utc::now(),
            build: build.to_string(),
            credentials: credentials.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&info)?;
        write_atomic(&self.info_path(), &json)?;
        Ok(())
    }

    fn info_path(&self) -> PathBuf {
        self.dir().join(WORKSPACE_INFO_FILE)
    }
}

/// Loads the info file. It is only a cache, so any failure yields `None`.
fn load_info(path: &Path) -> Option<WorkspaceInfo> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(error = %e, "failed to read workspace info file");
            return None;
        }
    };
    match serde_json::from_slice(&data) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(error = %e, "discarding unparsable workspace info file");
            None
        }
    }
}

/// Moves job artifacts written directly into `root` into `dir`.
///
/// Returns the number of files moved. Files already present in `dir` are
/// left where they are.
pub fn migrate_legacy(root: &Path, dir: &Path) -> Result<usize, StoreError> {
    let mut moved = 0;
    for entry in std::fs::read_dir(root)?.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_job_artifact = [JOB_FILE_SUFFIX, PAYLOAD_FILE_SUFFIX, RESUME_FILE_SUFFIX]
            .iter()
            .any(|suffix| name.ends_with(suffix));
        if !is_job_artifact {
            continue;
        }

        let target = dir.join(name);
        if target.exists() {
            warn!("legacy upload file already present in workspace, leaving it");
            continue;
        }
        std::fs::rename(&path, &target)?;
        moved += 1;
    }
    Ok(moved)
}
