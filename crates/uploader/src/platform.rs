//! Host collaborators: who is signed in, and how to keep the process
//! awake for a little while.

use std::sync::Mutex;

/// Supplies the active account identity.
pub trait SessionProvider: Send + Sync {
    /// Returns the signed-in account id, or `None` when signed out.
    fn account_id(&self) -> Option<String>;
}

/// A session whose account is set explicitly by the host.
#[derive(Debug, Default)]
pub struct StaticSession {
    account: Mutex<Option<String>>,
}

impl StaticSession {
    pub fn new(account: Option<String>) -> Self {
        Self {
            account: Mutex::new(account),
        }
    }

    pub fn sign_in(&self, account: impl Into<String>) {
        *self.account.lock().unwrap_or_else(|e| e.into_inner()) = Some(account.into());
    }

    pub fn sign_out(&self) {
        *self.account.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl SessionProvider for StaticSession {
    fn account_id(&self) -> Option<String> {
        self.account
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Keeps the host alive while held; released on drop.
pub struct BackgroundActivity {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl BackgroundActivity {
    /// An activity that needs no release.
    pub fn none() -> Self {
        Self { release: None }
    }

    /// An activity that runs `release` when dropped.
    pub fn with_release(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for BackgroundActivity {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for BackgroundActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundActivity")
            .field("releases", &self.release.is_some())
            .finish()
    }
}

/// Host platform hooks.
pub trait Platform: Send + Sync {
    /// Asks the host not to suspend the process until the guard is dropped.
    fn begin_background_activity(&self, reason: &str) -> BackgroundActivity;
}

/// Platform for hosts that never suspend (servers, CLIs, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPlatform;

impl Platform for NoopPlatform {
    fn begin_background_activity(&self, reason: &str) -> BackgroundActivity {
        tracing::trace!(reason, "background activity (no-op)");
        BackgroundActivity::none()
    }
}
