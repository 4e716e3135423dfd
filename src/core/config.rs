use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// HarvestConfig — file-based config loader (tabharvest.json) with env-var
// fallback. Sessions receive this explicitly at construction; there is no
// ambient global.
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "TABHARVEST_CONFIG";
pub const ENV_WAIT_SECS: &str = "TABHARVEST_WAIT_SECS";
pub const ENV_HEADLESS: &str = "TABHARVEST_HEADLESS";
pub const ENV_WORKDIR_ROOT: &str = "TABHARVEST_WORKDIR";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

/// Top-level config loaded from `tabharvest.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct HarvestConfig {
    /// Per-step wait budget in seconds (login markers, element polls).
    pub wait_time_secs: Option<u64>,
    /// Run the browser without a visible window. Defaults to `true`.
    pub headless: Option<bool>,
    /// Browser window width/height.
    pub window_width: Option<u32>,
    pub window_height: Option<u32>,
    /// Root under which disposable per-operation download dirs are created.
    pub workdir_root: Option<PathBuf>,
}

impl HarvestConfig {
    /// Wait budget: JSON field → `TABHARVEST_WAIT_SECS` env var → 30 s.
    pub fn resolve_wait_time(&self) -> Duration {
        let secs = self
            .wait_time_secs
            .or_else(|| {
                std::env::var(ENV_WAIT_SECS)
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(30);
        Duration::from_secs(secs)
    }

    /// Headless flag: JSON field → `TABHARVEST_HEADLESS` env var → `true`.
    pub fn resolve_headless(&self) -> bool {
        if let Some(b) = self.headless {
            return b;
        }
        let Ok(v) = std::env::var(ENV_HEADLESS) else {
            return true;
        };
        let v = v.trim().to_ascii_lowercase();
        !matches!(v.as_str(), "0" | "false" | "no" | "off")
    }

    /// Window size. Default matches what the portals render correctly at.
    pub fn resolve_window(&self) -> (u32, u32) {
        (
            self.window_width.unwrap_or(1400),
            self.window_height.unwrap_or(900),
        )
    }

    /// Root for disposable download dirs: JSON field → `TABHARVEST_WORKDIR`
    /// env var → the OS temp dir.
    pub fn resolve_workdir_root(&self) -> PathBuf {
        if let Some(p) = &self.workdir_root {
            return p.clone();
        }
        if let Ok(p) = std::env::var(ENV_WORKDIR_ROOT) {
            let p = p.trim();
            if !p.is_empty() {
                return PathBuf::from(p);
            }
        }
        std::env::temp_dir()
    }
}

/// Load `tabharvest.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `TABHARVEST_CONFIG` env var path
/// 2. `./tabharvest.json` (process cwd)
/// 3. `../tabharvest.json` (repo root when running from a member dir)
/// 4. `~/.config/tabharvest.json`
///
/// Missing file → `HarvestConfig::default()` (silent, env-var fallbacks apply).
/// Parse error → log a warning, return `HarvestConfig::default()`.
pub fn load_harvest_config() -> HarvestConfig {
    let mut candidates = vec![
        PathBuf::from("tabharvest.json"),
        PathBuf::from("../tabharvest.json"),
    ];
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("tabharvest.json"));
    }

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<HarvestConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("tabharvest.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "tabharvest.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return HarvestConfig::default();
                }
            },
            Err(_) => continue, // not found at this path — try next
        }
    }

    HarvestConfig::default()
}

/// Optional override for the Chromium-family browser executable.
///
/// Default behavior is auto-discovery (see `browser::manager`). This only
/// returns a value when `CHROME_EXECUTABLE` points at an existing path.
pub fn chrome_executable_override() -> Option<String> {
    let p = std::env::var(ENV_CHROME_EXECUTABLE).ok()?;
    let p = p.trim();
    if p.is_empty() {
        return None;
    }
    if Path::new(p).exists() {
        Some(p.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_config_is_empty() {
        let cfg = HarvestConfig::default();
        assert_eq!(cfg.resolve_window(), (1400, 900));
        assert_eq!(cfg.resolve_wait_time(), Duration::from_secs(30));
        assert!(cfg.resolve_headless());
    }

    #[test]
    fn json_fields_win_over_defaults() {
        let cfg: HarvestConfig = serde_json::from_str(
            r#"{"wait_time_secs": 5, "headless": false, "window_width": 1600}"#,
        )
        .unwrap();
        assert_eq!(cfg.resolve_wait_time(), Duration::from_secs(5));
        assert!(!cfg.resolve_headless());
        assert_eq!(cfg.resolve_window(), (1600, 900));
    }
}
