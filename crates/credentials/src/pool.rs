use std::time::Duration;

use chrono::{DateTime, Utc};
use skyhaul_protocol::Credential;
use skyhaul_protocol::constants::{FRESH_MARGIN, LOW_WATER_MARK, RESTART_THRESHOLD, USABLE_MARGIN};
use skyhaul_transfer::Job;
use tracing::debug;

/// Tuning for a [`CredentialPool`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Minimum remaining lifetime of a usable credential.
    pub usable_margin: Duration,
    /// Remaining lifetime of a fresh credential.
    pub fresh_margin: Duration,
    /// Refill when fewer usable credentials remain.
    pub low_water_mark: usize,
    /// Restart count above which `ensure` rotates the credential.
    pub restart_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            usable_margin: USABLE_MARGIN,
            fresh_margin: FRESH_MARGIN,
            low_water_mark: LOW_WATER_MARK,
            restart_threshold: RESTART_THRESHOLD,
        }
    }
}

/// What [`CredentialPool::ensure`] did to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    /// The job's credential is still good.
    Kept,
    /// A credential from the pool was assigned; `replaced` is the old one.
    Assigned { replaced: Option<Credential> },
    /// The job needs a credential and the pool has none to give.
    Unavailable,
}

/// Locally cached, unassigned credentials.
///
/// A credential leaves the pool when it is handed to a job and is never
/// returned, so each one is used by at most one job.
#[derive(Debug, Default)]
pub struct CredentialPool {
    config: PoolConfig,
    credentials: Vec<Credential>,
}

impl CredentialPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            credentials: Vec::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Cached credentials, for writing the workspace info file.
    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    /// Returns `true` if `credential` can still be used for `content_type`.
    pub fn is_usable(&self, credential: &Credential, content_type: &str, now: DateTime<Utc>) -> bool {
        credential.matches(content_type) && credential.lasts_beyond(now, self.config.usable_margin)
    }

    /// Returns `true` if `credential` outlives the fresh margin.
    pub fn is_fresh(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        credential.lasts_beyond(now, self.config.fresh_margin)
    }

    /// Number of cached credentials usable for `content_type`.
    pub fn usable_count(&self, content_type: &str, now: DateTime<Utc>) -> usize {
        self.credentials
            .iter()
            .filter(|c| self.is_usable(c, content_type, now))
            .count()
    }

    /// Returns `true` when the usable count for `content_type` is below the
    /// low-water mark.
    pub fn needs_refill(&self, content_type: &str, now: DateTime<Utc>) -> bool {
        self.usable_count(content_type, now) < self.config.low_water_mark
    }

    /// Adds an allocated batch, skipping duplicates and credentials that
    /// are already too close to expiry. Returns how many were added.
    pub fn absorb(&mut self, batch: Vec<Credential>, now: DateTime<Utc>) -> usize {
        let mut added = 0;
        for credential in batch {
            if !credential.lasts_beyond(now, self.config.usable_margin) {
                debug!(provider = %credential.provider, "dropping short-lived credential");
                continue;
            }
            if self.credentials.iter().any(|c| c.id == credential.id) {
                continue;
            }
            self.credentials.push(credential);
            added += 1;
        }
        added
    }

    /// Removes a credential by id.
    pub fn discard(&mut self, id: &str) -> Option<Credential> {
        let pos = self.credentials.iter().position(|c| c.id == id)?;
        Some(self.credentials.remove(pos))
    }

    /// Drops every credential that is no longer usable for anything.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.credentials.len();
        let margin = self.config.usable_margin;
        self.credentials.retain(|c| c.lasts_beyond(now, margin));
        before - self.credentials.len()
    }

    /// Empties the pool (workspace swap).
    pub fn clear(&mut self) -> Vec<Credential> {
        std::mem::take(&mut self.credentials)
    }

    /// Removes and returns a usable credential for `content_type`.
    ///
    /// With `prefer_fresh`, the longest-lived credential is chosen and a
    /// fresh one wins over a merely usable one. Otherwise the credential
    /// closest to expiry goes first.
    pub fn take(
        &mut self,
        content_type: &str,
        prefer_fresh: bool,
        now: DateTime<Utc>,
    ) -> Option<Credential> {
        let candidates = self
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| self.is_usable(c, content_type, now));

        let pos = if prefer_fresh {
            candidates.max_by_key(|(_, c)| c.expires_at).map(|(i, _)| i)
        } else {
            candidates.min_by_key(|(_, c)| c.expires_at).map(|(i, _)| i)
        }?;

        let credential = self.credentials.remove(pos);
        if prefer_fresh && !self.is_fresh(&credential, now) {
            debug!("no fresh credential cached, using a usable one");
        }
        Some(credential)
    }

    /// Makes sure `job` holds a credential worth transferring with.
    ///
    /// The current credential is kept while it is usable and the job has
    /// not restarted more than the threshold allows. Otherwise it is
    /// dropped and replaced from the pool, which resets the restart
    /// counter. Without a replacement the job is left without a credential.
    pub fn ensure(&mut self, job: &mut Job, now: DateTime<Utc>) -> EnsureOutcome {
        if job.is_completed() {
            return EnsureOutcome::Kept;
        }

        let over_threshold = job.restart_count() > self.config.restart_threshold;
        let keep = job
            .credential()
            .is_some_and(|c| self.is_usable(c, job.content_type(), now) && !over_threshold);
        if keep {
            return EnsureOutcome::Kept;
        }

        let prefer_fresh = job.restart_count() > 0 || job.has_started();
        let replaced = job.discard_credential();
        match self.take(job.content_type(), prefer_fresh, now) {
            Some(credential) => {
                job.assign_credential(credential);
                EnsureOutcome::Assigned { replaced }
            }
            None => EnsureOutcome::Unavailable,
        }
    }
}
