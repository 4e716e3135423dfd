/// Integration tests for the download-orchestration pipeline.
///
/// No browser, network, or mailbox: the portal side is simulated by tasks
/// writing files into the session's download directory, which is the only
/// signal the materialization protocol observes anyway.
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tabharvest::protocol::retry::{retry, RetryPolicy};
use tabharvest::protocol::wait::await_artifact;
use tabharvest::tabular::{parse_artifact, parse_csv_bytes, ParseOptions};
use tabharvest::{ArtifactFormat, HarvestError, ReportRequest, Table};

// Initialize logging for tests
fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

/// Simulate a portal: after `delay`, write `contents` into `dir`.
fn spawn_portal_export(
    dir: std::path::PathBuf,
    name: &'static str,
    contents: &'static str,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        std::fs::write(dir.join(name), contents).unwrap();
    })
}

#[tokio::test(start_paused = true)]
async fn end_to_end_simulated_download() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let writer = spawn_portal_export(
        dir.path().to_path_buf(),
        "enrollment_export.csv",
        "student_id,school,grade\n1001,North,3\n1002,South,5\n",
        Duration::from_secs(4),
    );

    let cancel = CancellationToken::new();
    let artifact = await_artifact(
        dir.path(),
        Some(ArtifactFormat::Csv),
        Duration::from_secs(60),
        &cancel,
    )
    .await
    .unwrap();
    writer.await.unwrap();
    assert_eq!(artifact.format, Some(ArtifactFormat::Csv));

    let table =
        parse_artifact(&artifact.path, ArtifactFormat::Csv, &ParseOptions::default()).unwrap();
    assert_eq!(table.columns, vec!["student_id", "school", "grade"]);
    assert_eq!(table.row_count(), 2);
    assert_eq!(table.rows[0], vec!["1001", "North", "3"]);

    // Consumption deletes the artifact so the directory is never reused
    // with stale data.
    std::fs::remove_file(&artifact.path).unwrap();
    assert!(!artifact.path.exists());
}

#[tokio::test(start_paused = true)]
async fn two_runs_never_see_each_others_artifacts() {
    init_logger();
    let run_a = tempfile::tempdir().unwrap();
    let run_b = tempfile::tempdir().unwrap();

    spawn_portal_export(
        run_a.path().to_path_buf(),
        "export.csv",
        "id\nA\n",
        Duration::from_secs(1),
    );
    spawn_portal_export(
        run_b.path().to_path_buf(),
        "export.csv",
        "id\nB\n",
        Duration::from_secs(2),
    );

    let cancel = CancellationToken::new();
    let a = await_artifact(
        run_a.path(),
        Some(ArtifactFormat::Csv),
        Duration::from_secs(30),
        &cancel,
    )
    .await
    .unwrap();
    let b = await_artifact(
        run_b.path(),
        Some(ArtifactFormat::Csv),
        Duration::from_secs(30),
        &cancel,
    )
    .await
    .unwrap();

    assert_ne!(a.path, b.path);
    let table_a = parse_artifact(&a.path, ArtifactFormat::Csv, &ParseOptions::default()).unwrap();
    let table_b = parse_artifact(&b.path, ArtifactFormat::Csv, &ParseOptions::default()).unwrap();
    assert_eq!(table_a.rows[0][0], "A");
    assert_eq!(table_b.rows[0][0], "B");
}

#[test]
fn zero_row_artifact_is_rejected_but_tolerated_where_documented() {
    init_logger();
    let header_only = b"admin_id,name,email\n";
    let table = parse_csv_bytes(header_only, &ParseOptions::default()).unwrap();
    assert!(table.is_empty());

    let request = ReportRequest::new("/data-browser/export/students");
    let err =
        tabharvest::protocol::report::ensure_rows(table.clone(), &request, false).unwrap_err();
    assert!(matches!(err, HarvestError::NoData(_)));

    let admins = ReportRequest::new("/data-browser/export/schooladmins");
    let ok = tabharvest::protocol::report::ensure_rows(table, &admins, true).unwrap();
    assert_eq!(ok.row_count(), 0);
    assert_eq!(ok.columns, vec!["admin_id", "name", "email"]);
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_is_distinct_from_the_last_attempt_error() {
    init_logger();
    let policy = RetryPolicy::new(3, Duration::from_secs(1));
    let err = retry(policy, "always-timing-out", || async {
        Err::<Table, _>(HarvestError::Timeout {
            what: tabharvest::WaitTarget::File,
            waited: Duration::from_secs(60),
        })
    })
    .await
    .unwrap_err();

    let HarvestError::RetriesExhausted { attempts, source } = err else {
        panic!("expected RetriesExhausted");
    };
    assert_eq!(attempts, 3);
    assert!(matches!(*source, HarvestError::Timeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn relay_style_wait_finds_the_message_on_a_later_poll() {
    init_logger();
    // The mailbox poll reduces to the same shape as every other wait: a
    // retried probe that returns ReportNotReady until the message exists.
    // Simulate three polls with the "message" appearing on the third.
    let polls = std::sync::atomic::AtomicU32::new(0);
    let pattern = regex::Regex::new(r"https://assets\.[-a-z0-9.]+/\S+\.csv").unwrap();

    let policy = RetryPolicy::new(5, Duration::from_secs(240));
    let body = retry(policy, "mailbox-poll", || {
        let n = polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(HarvestError::Mailbox("no matching message yet".into()))
            } else {
                Ok("Your export is ready: https://assets.cdn.example/exports/x9.csv".to_string())
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(polls.load(std::sync::atomic::Ordering::SeqCst), 3);
    let link = tabharvest::relay::extract_link(&pattern, &body).unwrap();
    assert_eq!(link, "https://assets.cdn.example/exports/x9.csv");
}

#[tokio::test(start_paused = true)]
async fn download_timeout_surfaces_as_a_file_wait_timeout() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    // A partial download sits in the directory the whole time.
    std::fs::write(dir.path().join("export.csv.crdownload"), "half").unwrap();

    let cancel = CancellationToken::new();
    let err = await_artifact(
        dir.path(),
        Some(ArtifactFormat::Csv),
        Duration::from_secs(10),
        &cancel,
    )
    .await
    .unwrap_err();

    match err {
        HarvestError::Timeout { what, .. } => {
            assert_eq!(what, tabharvest::WaitTarget::File);
        }
        other => panic!("expected file-wait timeout, got {other}"),
    }
}
