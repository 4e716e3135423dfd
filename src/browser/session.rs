//! Session = service identity + credentials + environment knobs.
//!
//! A [`Session`] owns nothing live. Each download call acquires a fresh
//! [`Driver`](super::manager::Driver) through [`Session::with_driver`], which
//! guarantees the browser is closed on success and failure alike, and a fresh
//! [`Workdir`] so concurrent operations never race over each other's files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::core::config::HarvestConfig;
use crate::core::error::{HarvestError, Result};
use crate::core::types::Credentials;

use super::manager::{Driver, DriverConfig};

/// Per-service connection state shared by every operation on that service.
#[derive(Debug, Clone)]
pub struct Session {
    /// Short service tag used in logs and error messages ("roster", "meals").
    pub service: String,
    pub credentials: Credentials,
    /// Portal root; report URLs are interpreted relative to this.
    pub base_url: Url,
    /// Per-step wait budget (login markers, element polls).
    pub wait_time: Duration,
    pub headless: bool,
    pub window: (u32, u32),
    workdir_root: PathBuf,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        service: impl Into<String>,
        credentials: Credentials,
        base_url: Url,
        config: &HarvestConfig,
    ) -> Self {
        Self {
            service: service.into(),
            credentials,
            base_url,
            wait_time: config.resolve_wait_time(),
            headless: config.resolve_headless(),
            window: config.resolve_window(),
            workdir_root: config.resolve_workdir_root(),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this session's polling loops to an external cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Run with a visible browser window. Debugging aid.
    pub fn visible(mut self) -> Self {
        self.headless = false;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Create the download directory for one operation.
    ///
    /// `None` yields a disposable temp dir under the configured root, removed
    /// after the artifact has been parsed. `Some(dir)` is persistent: it is
    /// created if missing and cleared of leftover files so the waiter cannot
    /// pick up a stale artifact from a previous run.
    pub fn provision_workdir(&self, output_dir: Option<&Path>) -> Result<Workdir> {
        match output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                clear_directory(dir)?;
                Ok(Workdir {
                    path: dir.to_path_buf(),
                    temp: None,
                })
            }
            None => {
                std::fs::create_dir_all(&self.workdir_root)?;
                let temp = tempfile::Builder::new()
                    .prefix("tabharvest-")
                    .tempdir_in(&self.workdir_root)?;
                Ok(Workdir {
                    path: temp.path().to_path_buf(),
                    temp: Some(temp),
                })
            }
        }
    }

    /// Launch a browser whose downloads land in `download_dir`, run `f`, and
    /// close the browser regardless of the outcome.
    pub async fn with_driver<T, F>(&self, download_dir: &Path, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&Driver) -> Result<T>,
    {
        if self.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        let driver = Driver::launch(&DriverConfig {
            download_dir: Some(download_dir.to_path_buf()),
            headless: self.headless,
            window: self.window,
            executable: None,
        })
        .await?;

        let result = f(&driver).await;
        driver.close().await;
        result
    }
}

/// The directory one download operation writes into.
///
/// Disposable workdirs hold a `TempDir` guard, so an early return or panic
/// still removes the directory when the `Workdir` drops. [`Workdir::dispose`]
/// is the deliberate success-path removal.
#[derive(Debug)]
pub struct Workdir {
    path: PathBuf,
    temp: Option<tempfile::TempDir>,
}

impl Workdir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_disposable(&self) -> bool {
        self.temp.is_some()
    }

    /// Remove a disposable workdir now that its artifact has been extracted.
    /// Persistent workdirs are left in place for the caller.
    pub fn dispose(self) -> Result<()> {
        if let Some(temp) = self.temp {
            temp.close()?;
        }
        Ok(())
    }
}

/// Delete regular files directly under `dir`. Subdirectories are left alone.
pub fn clear_directory(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            let path = entry.path();
            debug!(file = %path.display(), "clearing stale file from workdir");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), "could not clear stale file: {e}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        Session::new(
            "roster",
            Credentials::new("user@district.org", "pw"),
            Url::parse("https://portal.example.com").unwrap(),
            &HarvestConfig::default(),
        )
    }

    #[test]
    fn disposable_workdir_is_removed_on_dispose() {
        let session = test_session();
        let workdir = session.provision_workdir(None).unwrap();
        let path = workdir.path().to_path_buf();
        assert!(path.exists());
        assert!(workdir.is_disposable());
        workdir.dispose().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn disposable_workdir_is_removed_on_drop() {
        let session = test_session();
        let workdir = session.provision_workdir(None).unwrap();
        let path = workdir.path().to_path_buf();
        drop(workdir);
        assert!(!path.exists());
    }

    #[test]
    fn persistent_workdir_is_cleared_and_kept() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("exports");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("stale.csv"), "old").unwrap();

        let session = test_session();
        let workdir = session.provision_workdir(Some(&target)).unwrap();
        assert!(!workdir.is_disposable());
        assert!(!target.join("stale.csv").exists());
        workdir.dispose().unwrap();
        assert!(target.exists());
    }

    #[test]
    fn sibling_workdirs_never_collide() {
        let session = test_session();
        let a = session.provision_workdir(None).unwrap();
        let b = session.provision_workdir(None).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
