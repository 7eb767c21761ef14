use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use skyhaul_protocol::JobRecord;
use skyhaul_protocol::constants::{
    JOB_FILE_SUFFIX, PAYLOAD_FILE_SUFFIX, RESUME_FILE_SUFFIX, TEMP_FILE_SUFFIX,
};
use skyhaul_transfer::Job;
use tracing::{debug, warn};

use crate::StoreError;

/// File-backed job metadata, one JSON file per job.
///
/// The store holds no cache: every call reads or writes the disk.
#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    /// Creates a store rooted at `dir`. The directory must already exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocates a new in-memory job. Nothing is written yet.
    pub fn create(
        &self,
        byte_size: u64,
        content_type: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Job {
        Job::new(byte_size, content_type, metadata)
    }

    /// Path of the metadata file for `job_id`.
    pub fn metadata_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}{JOB_FILE_SUFFIX}"))
    }

    /// Path of the payload copy for `job_id`.
    pub fn payload_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}{PAYLOAD_FILE_SUFFIX}"))
    }

    /// Path of the partial-resume tail for `job_id`.
    pub fn resume_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}{RESUME_FILE_SUFFIX}"))
    }

    /// Writes the job's full state to its metadata file, atomically.
    pub fn persist(&self, job: &Job) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&job.to_record())?;
        write_atomic(&self.metadata_path(job.id()), &json)?;
        Ok(())
    }

    /// Parses a metadata file back into a job.
    ///
    /// Returns `None` (and logs) when the file is unreadable or violates
    /// the schema; one bad file never affects the others.
    pub fn load(&self, path: &Path) -> Option<Job> {
        match read_job(path) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "skipping unreadable job file");
                None
            }
        }
    }

    /// Removes the metadata, payload and resume artifacts of a job.
    ///
    /// Already-missing files are not an error.
    pub fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        self.delete_payload(job_id)?;
        remove_if_exists(&self.metadata_path(job_id))?;
        Ok(())
    }

    /// Removes the payload and resume artifacts, keeping the metadata.
    pub fn delete_payload(&self, job_id: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.payload_path(job_id))?;
        self.delete_resume(job_id)
    }

    /// Removes the partial-resume tail, if any.
    pub fn delete_resume(&self, job_id: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.resume_path(job_id))?;
        Ok(())
    }

    /// Loads every readable job in the directory.
    ///
    /// Leftover temp files from interrupted writes are removed, as are
    /// payload and resume files whose job has no metadata file.
    pub fn scan(&self) -> Result<Vec<Job>, StoreError> {
        self.scan_skipping(&HashSet::new())
    }

    /// Like [`JobStore::scan`], but leaves the artifacts of the ids in
    /// `in_flight` alone even when they have no metadata yet.
    pub fn scan_skipping(&self, in_flight: &HashSet<String>) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut artifacts = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(TEMP_FILE_SUFFIX) {
                debug!("removing orphan temp file");
                let _ = std::fs::remove_file(&path);
            } else if name.ends_with(JOB_FILE_SUFFIX) {
                if let Some(job) = self.load(&path) {
                    jobs.push(job);
                }
            } else if let Some(job_id) = name
                .strip_suffix(PAYLOAD_FILE_SUFFIX)
                .or_else(|| name.strip_suffix(RESUME_FILE_SUFFIX))
            {
                artifacts.push((job_id.to_string(), path.clone()));
            }
        }

        for (job_id, path) in artifacts {
            if in_flight.contains(&job_id) || self.metadata_path(&job_id).exists() {
                continue;
            }
            debug!(job = %job_id, "removing artifact without metadata");
            let _ = std::fs::remove_file(&path);
        }

        jobs.sort_by(|a, b| a.created_at().cmp(&b.created_at()));
        Ok(jobs)
    }
}

fn read_job(path: &Path) -> Result<Job, StoreError> {
    let data = std::fs::read(path)?;
    let record: JobRecord = serde_json::from_slice(&data)?;
    Ok(Job::try_from(record)?)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Writes `data` to `path` via a sibling temp file and a rename, so a
/// crash mid-write leaves either the old file or the new one.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TEMP_FILE_SUFFIX);
    let tmp = PathBuf::from(tmp_name);

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
