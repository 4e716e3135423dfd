//! File-materialization waiter.
//!
//! Browser-triggered exports land on disk asynchronously, so the only
//! completion signal is a matching file appearing in the session's download
//! directory. [`await_artifact`] polls for that at a fixed cadence and,
//! unlike a bare sleep loop, always reports budget exhaustion as an error:
//! a silent timeout here would hand downstream parsing a missing file.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{HarvestError, Result, WaitTarget};
use crate::core::types::{is_partial_download, Artifact, ArtifactFormat};

/// Disk polls are deliberately coarse; exports take seconds to minutes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `dir` until a matching file materializes or `timeout` elapses.
///
/// With a `format` filter, browser partial-download temp files
/// (`.crdownload`, `.part`, `.tmp`) never match, so the returned artifact
/// is a completed download. Without a filter any file satisfies the wait.
pub async fn await_artifact(
    dir: &Path,
    format: Option<ArtifactFormat>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Artifact> {
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        if let Some(path) = most_recent_file(dir, format)? {
            debug!(
                file = %path.display(),
                waited = ?start.elapsed(),
                "artifact materialized"
            );
            return Artifact::from_path(path);
        }
        if start.elapsed() >= timeout {
            return Err(HarvestError::Timeout {
                what: WaitTarget::File,
                waited: start.elapsed(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Most recently modified file under `dir` (recursing into subdirectories),
/// or `None` when nothing matches.
///
/// With a `format`, partial downloads and other extensions are skipped.
/// Without one, every file counts, partials included; the unfiltered form
/// exists for callers that only need "has anything appeared yet".
pub fn most_recent_file(dir: &Path, format: Option<ArtifactFormat>) -> Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    collect_newest(dir, format, &mut newest)?;
    Ok(newest.map(|(_, path)| path))
}

fn collect_newest(
    dir: &Path,
    format: Option<ArtifactFormat>,
    newest: &mut Option<(SystemTime, PathBuf)>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_newest(&path, format, newest)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        if let Some(f) = format {
            if is_partial_download(&path) || !f.matches(&path) {
                continue;
            }
        }
        let modified = entry
            .metadata()?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let newer = match newest {
            Some((best, _)) => modified > *best,
            None => true,
        };
        if newer {
            *newest = Some((modified, path));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waiter_returns_file_that_appears_later() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("export.csv");
        let writer = {
            let target = target.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                std::fs::write(&target, "id,name\n1,x\n").unwrap();
            })
        };

        let cancel = CancellationToken::new();
        let found = await_artifact(
            dir.path(),
            Some(ArtifactFormat::Csv),
            Duration::from_secs(30),
            &cancel,
        )
        .await
        .unwrap();
        writer.await.unwrap();
        assert_eq!(found.path, target);
        assert_eq!(found.format, Some(ArtifactFormat::Csv));
        assert_ne!(found.modified, std::time::SystemTime::UNIX_EPOCH);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_with_an_error_not_silence() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let err = await_artifact(
            dir.path(),
            Some(ArtifactFormat::Csv),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        match err {
            HarvestError::Timeout { what, waited } => {
                assert_eq!(what, WaitTarget::File);
                assert!(waited >= Duration::from_secs(5));
            }
            other => panic!("expected Timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_download_never_satisfies_a_filtered_wait() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("export.csv.crdownload"), "half").unwrap();

        let cancel = CancellationToken::new();
        let err = await_artifact(
            dir.path(),
            Some(ArtifactFormat::Csv),
            Duration::from_secs(3),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarvestError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                cancel.cancel();
            })
        };
        let err = await_artifact(
            dir.path(),
            Some(ArtifactFormat::Csv),
            Duration::from_secs(60),
            &cancel,
        )
        .await
        .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, HarvestError::Cancelled));
    }

    #[test]
    fn most_recent_picks_newest_matching_file_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("nested");
        std::fs::create_dir_all(&sub).unwrap();

        let old = dir.path().join("old.csv");
        let new = sub.join("new.csv");
        std::fs::write(&old, "a").unwrap();
        std::fs::write(&new, "b").unwrap();
        // Force distinct mtimes without sleeping.
        let earlier = SystemTime::now() - Duration::from_secs(60);
        let f = std::fs::File::open(&old).unwrap();
        f.set_modified(earlier).unwrap();

        let found = most_recent_file(dir.path(), Some(ArtifactFormat::Csv))
            .unwrap()
            .unwrap();
        assert_eq!(found, new);

        // The .xlsx filter sees neither csv.
        assert!(most_recent_file(dir.path(), Some(ArtifactFormat::Xlsx))
            .unwrap()
            .is_none());
    }

    #[test]
    fn unfiltered_scan_accepts_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("export.csv.part"), "half").unwrap();
        assert!(most_recent_file(dir.path(), None).unwrap().is_some());
    }
}
