//! Native browser management using `chromiumoxide`.
//!
//! Single source of truth for:
//! * Finding a usable Chromium-family executable (env override → PATH →
//!   well-known install locations).
//! * Building a launch config whose downloads land in a caller-supplied
//!   directory with no prompts or download-protection interstitials.
//! * [`Driver`] — one launched browser + its CDP event-handler task, with
//!   `close()` on every exit path and a `Drop` backstop so no code path
//!   leaks a browser process.

use std::path::{Path, PathBuf};

use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::chrome_executable_override;
use crate::core::error::{HarvestError, Result};

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var (explicit override)
/// 2. PATH scan — finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    if let Some(p) = chrome_executable_override() {
        return Some(p);
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "brave-browser",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/usr/bin/brave-browser",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Launch configuration ─────────────────────────────────────────────────────

/// How a [`Driver`] should be launched for one download operation.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Directory the browser writes downloads into, without prompting.
    pub download_dir: Option<PathBuf>,
    pub headless: bool,
    pub window: (u32, u32),
    /// Explicit executable; `None` means auto-discovery.
    pub executable: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            headless: true,
            window: (1400, 900),
            executable: None,
        }
    }
}

/// Build a `BrowserConfig` for a report-download session.
///
/// Flags chosen for compatibility with CI / containers (`--no-sandbox`,
/// `--disable-dev-shm-usage`). Headless and visible modes get the same flags
/// otherwise, so behavior is identical across the two.
fn build_browser_config(exe: &str, cfg: &DriverConfig) -> Result<BrowserConfig> {
    let (width, height) = cfg.window;

    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        // The portals serve plain form logins; download protection is the
        // only Chrome feature that interferes with unattended exports.
        .arg("--safebrowsing-disable-download-protection");

    if !cfg.headless {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| HarvestError::Browser(format!("failed to build browser config: {e}")))
}

// ── Driver lifecycle ─────────────────────────────────────────────────────────

/// One launched browser bound to one download directory.
///
/// A `Driver` is acquired at the start of a download call and must be
/// released at the end of that call, successful or not. Callers go through
/// `Session::with_driver`, which closes on both paths; `Drop` is only a
/// backstop against panics.
pub struct Driver {
    browser: Option<Browser>,
    handler_task: JoinHandle<()>,
    page: Page,
}

impl Driver {
    /// Launch a browser per `cfg` and open a blank tab.
    ///
    /// When `cfg.download_dir` is set, the tab is configured via CDP so file
    /// downloads land there with no "ask where to save" prompt.
    pub async fn launch(cfg: &DriverConfig) -> Result<Self> {
        let exe = match &cfg.executable {
            Some(e) => e.clone(),
            None => find_chrome_executable().ok_or_else(|| {
                HarvestError::Browser(
                    "no browser found; install Chrome or Chromium, or set CHROME_EXECUTABLE"
                        .into(),
                )
            })?,
        };

        info!(
            executable = %exe,
            headless = cfg.headless,
            "launching browser session"
        );

        let config = build_browser_config(&exe, cfg)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| HarvestError::Browser(format!("failed to launch ({exe}): {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(p) => p,
            Err(e) => {
                let mut browser = browser;
                let _ = browser.close().await;
                handler_task.abort();
                return Err(HarvestError::Browser(format!("failed to open tab: {e}")));
            }
        };

        let driver = Self {
            browser: Some(browser),
            handler_task,
            page,
        };

        if let Some(dir) = &cfg.download_dir {
            driver.set_download_dir(dir).await?;
        }

        Ok(driver)
    }

    /// Point browser downloads at `dir`, bypassing all prompts.
    async fn set_download_dir(&self, dir: &Path) -> Result<()> {
        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(dir.to_string_lossy().to_string())
            .build()
            .map_err(HarvestError::Browser)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| HarvestError::Browser(format!("set download behavior: {e}")))?;
        debug!(dir = %dir.display(), "download directory configured");
        Ok(())
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        debug!(url, "navigating");
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|e| HarvestError::Browser(format!("navigation to {url} failed: {e}")))
    }

    /// Terminate the browser process and stop the event-handler task.
    pub async fn close(mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("browser close error (non-fatal): {}", e);
            }
        }
        self.handler_task.abort();
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Best-effort cleanup. Drop cannot await; if we're inside a tokio
        // runtime, spawn a task to close the browser so a panic between
        // launch and close doesn't leave a zombie process.
        self.handler_task.abort();
        let Some(mut browser) = self.browser.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = browser.close().await;
            });
        }
    }
}
