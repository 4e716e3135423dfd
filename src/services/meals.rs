//! Meal-eligibility portal.
//!
//! The report viewer offers an export-format dropdown whose options vary by
//! district configuration: CSV when enabled, otherwise a legacy XLS. The
//! two formats bury the header at different depths, so format selection and
//! parse options travel together.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::browser::dom;
use crate::browser::manager::Driver;
use crate::browser::session::Session;
use crate::core::error::{HarvestError, Result};
use crate::core::types::{ArtifactFormat, ReportRequest, Table};
use crate::protocol::login::{login, LoginSpec, Marker, SubmitAction};
use crate::protocol::report::{ensure_rows, interpret_report_url, ReportStrategy};
use crate::protocol::wait::await_artifact;
use crate::tabular::{parse_artifact, ParseOptions};

const FORMAT_SELECT: &str = "select#export-format";
const EXPORT_BUTTON: &str = "button#export-report";

/// Header depth differs per export format: two banner rows above a CSV
/// header, three above the XLS one.
const CSV_HEADER_ROW: usize = 2;
const XLS_HEADER_ROW: usize = 3;

pub struct MealsStrategy;

#[async_trait]
impl ReportStrategy for MealsStrategy {
    fn service(&self) -> &str {
        "meals"
    }

    fn login_spec(&self) -> LoginSpec {
        LoginSpec::new(
            "/Login.aspx",
            "input#txtUserName",
            "input#txtPassword",
            SubmitAction::Click("input#btnLogin".to_string()),
            Marker::Element("#main-menu".to_string()),
        )
        .with_rejection_marker(Marker::Element("#lblLoginError".to_string()))
    }
}

/// Download a report from the viewer, preferring CSV and falling back to
/// the legacy XLS export when the district has CSV disabled.
pub async fn download_report(session: &Session, request: &ReportRequest) -> Result<Table> {
    let workdir = session.provision_workdir(request.output_dir.as_deref())?;
    let download_dir = workdir.path().to_path_buf();

    let table = session
        .with_driver(&download_dir, async |driver| {
            run_export(driver, session, request, download_dir.clone()).await
        })
        .await?;

    workdir.dispose()?;
    ensure_rows(table, request, false)
}

async fn run_export(
    driver: &Driver,
    session: &Session,
    request: &ReportRequest,
    download_dir: std::path::PathBuf,
) -> Result<Table> {
    let strategy = MealsStrategy;
    login(driver, session, &strategy.login_spec(), None).await?;

    let url = interpret_report_url(&session.base_url, &request.report_url);
    driver.goto(&url).await?;
    dom::wait_for_element(
        driver.page(),
        FORMAT_SELECT,
        session.wait_time,
        session.cancel_token(),
    )
    .await?;

    // Probe for the CSV option; its absence is a configuration, not an error.
    let csv_offered = dom::select_by_value(driver.page(), FORMAT_SELECT, "csv").await?;
    let xls_offered = if csv_offered {
        false
    } else {
        debug!("CSV export not offered, falling back to XLS");
        dom::select_by_value(driver.page(), FORMAT_SELECT, "xls").await?
    };
    let (format, header_row) = choose_export_format(csv_offered, xls_offered)?;
    info!(service = %session.service, ?format, "exporting report");

    dom::click(
        driver.page(),
        EXPORT_BUTTON,
        session.wait_time,
        session.cancel_token(),
    )
    .await?;

    let artifact = await_artifact(
        &download_dir,
        Some(format),
        strategy.download_timeout(),
        session.cancel_token(),
    )
    .await?;

    let opts = ParseOptions::default().with_header_row(header_row);
    let table = parse_artifact(&artifact.path, format, &opts)?;
    std::fs::remove_file(&artifact.path)?;
    Ok(table)
}

/// Pick the export format from what the viewer's dropdown actually offers.
/// A viewer offering neither is a fatal interface change: clicking export
/// with an unknown selection would only die later as a file-wait timeout.
fn choose_export_format(csv_offered: bool, xls_offered: bool) -> Result<(ArtifactFormat, usize)> {
    if csv_offered {
        Ok((ArtifactFormat::Csv, CSV_HEADER_ROW))
    } else if xls_offered {
        Ok((ArtifactFormat::Xlsx, XLS_HEADER_ROW))
    } else {
        Err(HarvestError::Browser(
            "report viewer offers neither csv nor xls export".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_wins_when_offered_and_xls_is_the_fallback() {
        assert_eq!(
            choose_export_format(true, false).unwrap(),
            (ArtifactFormat::Csv, CSV_HEADER_ROW)
        );
        assert_eq!(
            choose_export_format(false, true).unwrap(),
            (ArtifactFormat::Xlsx, XLS_HEADER_ROW)
        );
    }

    #[test]
    fn a_viewer_offering_neither_format_fails_distinctly() {
        let err = choose_export_format(false, false).unwrap_err();
        match err {
            HarvestError::Browser(msg) => assert!(msg.contains("neither csv nor xls")),
            other => panic!("expected Browser error, got {other}"),
        }
    }
}
