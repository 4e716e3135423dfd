//! Enrollment-management portal.
//!
//! The most stateful of the portals: every report is scoped by a school-year
//! dropdown that must be verified after selection, built-in reports stream
//! rows into the page before the export control works, and custom reports
//! live in a paginated catalog with a generate / in-progress button
//! protocol. Custom reports export either a single CSV or a zip of CSVs.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::browser::dom;
use crate::browser::manager::Driver;
use crate::browser::session::Session;
use crate::core::error::{HarvestError, Result};
use crate::core::types::{Artifact, ArtifactFormat, ReportRequest, Table, TriggerOutcome};
use crate::protocol::login::{login, LoginSpec, Marker, SubmitAction};
use crate::protocol::report::{
    classify_trigger_label, download_report, ensure_rows, interpret_report_url,
    wait_for_stable_text, ContextSelector, PaginatedList, ReportStrategy,
};
use crate::protocol::wait::await_artifact;
use crate::tabular::{parse_artifact, unpack_zip, ParseOptions};

const CUSTOM_REPORTS_PATH: &str = "/report/custom";
const EXPORT_CONTROL: &str = "a.export-table";
const ROW_COUNT_SUMMARY: &str = "div.dataTables_info";
const ROW_DOWNLOAD_CONTROL: &str = "a.download-report";

/// Chat widgets and announcement modals that cover the export controls.
const OVERLAY_SELECTORS: &[&str] = &[
    "iframe.intercom-launcher-frame",
    "div.modal-backdrop",
    "div#announcement-modal",
];

fn year_selector() -> ContextSelector {
    ContextSelector {
        menu: "a.dropdown-toggle.enrollment".to_string(),
        options: "#enrollment-selector a".to_string(),
        readback: "a.dropdown-toggle.enrollment span.current".to_string(),
        settle: Some("#student-lookup".to_string()),
    }
}

fn custom_report_catalog() -> PaginatedList {
    PaginatedList {
        page_links: "ul.pagination a[data-page]".to_string(),
        rows: "table#custom-reports tbody tr".to_string(),
    }
}

pub struct EnrollmentStrategy;

#[async_trait]
impl ReportStrategy for EnrollmentStrategy {
    fn service(&self) -> &str {
        "enrollment"
    }

    fn login_spec(&self) -> LoginSpec {
        LoginSpec::new(
            "/signin",
            "input#email",
            "input#password",
            SubmitAction::Click("button#login-submit".to_string()),
            Marker::Element("#student-lookup".to_string()),
        )
        .with_rejection_marker(Marker::Element("div.alert-danger".to_string()))
    }

    fn context_selector(&self) -> Option<ContextSelector> {
        Some(year_selector())
    }

    /// Built-in report views expose their filters as named `<select>`
    /// controls; each parameter key addresses one. A key without a control,
    /// or a value the control does not offer, is a caller error.
    async fn apply_parameters(
        &self,
        driver: &Driver,
        _session: &Session,
        request: &ReportRequest,
    ) -> Result<()> {
        for (key, value) in &request.parameters {
            let selector = format!("select[name=\"{key}\"]");
            if !dom::select_by_value(driver.page(), &selector, value).await? {
                return Err(HarvestError::MalformedInput(format!(
                    "report filter {key:?} does not offer {value:?}"
                )));
            }
            debug!(filter = %key, value = %value, "report filter applied");
        }
        Ok(())
    }

    /// Built-in report views stream rows after load; the export control
    /// only produces the full file once the row-count summary stops moving.
    async fn trigger_export(
        &self,
        driver: &Driver,
        session: &Session,
        _request: &ReportRequest,
    ) -> Result<()> {
        dismiss_overlays(driver).await?;
        let summary = wait_for_stable_text(driver, ROW_COUNT_SUMMARY, session).await?;
        debug!(summary = %summary, "report table settled");
        dom::click(
            driver.page(),
            EXPORT_CONTROL,
            session.wait_time,
            session.cancel_token(),
        )
        .await
    }
}

/// Remove known overlays covering the page controls. All optional: a page
/// without them is the normal case.
pub async fn dismiss_overlays(driver: &Driver) -> Result<()> {
    for selector in OVERLAY_SELECTORS {
        let removed = dom::remove_elements(driver.page(), selector).await?;
        if removed > 0 {
            debug!(selector, removed, "dismissed overlay");
        }
    }
    Ok(())
}

/// Download a built-in report view, scoped to `request.context` (the school
/// year) when set.
pub async fn download_url_report(session: &Session, request: &ReportRequest) -> Result<Table> {
    download_report(&EnrollmentStrategy, session, request).await
}

/// Ask the portal to (re)generate a named custom report.
///
/// Returns whether a fresh run was started or one was already in progress.
pub async fn generate_custom_report(
    session: &Session,
    year: &str,
    report_name: &str,
) -> Result<TriggerOutcome> {
    let workdir = session.provision_workdir(None)?;
    let outcome = session
        .with_driver(workdir.path(), async move |driver| {
            {
                let trigger = open_custom_report_row(driver, session, year, report_name).await?;
                if trigger == TriggerOutcome::Started {
                    custom_report_catalog()
                        .click_trigger(driver, report_name)
                        .await?;
                    info!(report = report_name, "report generation started");
                } else {
                    info!(report = report_name, "report already generating");
                }
                Ok(trigger)
            }
        })
        .await?;
    workdir.dispose()?;
    Ok(outcome)
}

/// Whether a named custom report is currently generating.
pub async fn is_custom_report_generating(
    session: &Session,
    year: &str,
    report_name: &str,
) -> Result<bool> {
    let workdir = session.provision_workdir(None)?;
    let outcome = session
        .with_driver(workdir.path(), async move |driver| {
            open_custom_report_row(driver, session, year, report_name).await
        })
        .await?;
    workdir.dispose()?;
    Ok(outcome == TriggerOutcome::AlreadyRunning)
}

/// Download a single-CSV custom report.
///
/// When the report is mid-generation, `download_if_generating` decides
/// between fetching the last completed artifact and failing with
/// [`HarvestError::ReportNotReady`].
pub async fn download_csv_custom_report(
    session: &Session,
    year: &str,
    report_name: &str,
    download_if_generating: bool,
) -> Result<Table> {
    let request = ReportRequest::new(CUSTOM_REPORTS_PATH);
    let workdir = session.provision_workdir(None)?;
    let download_dir = workdir.path().to_path_buf();
    let wait_dir = download_dir.clone();

    let table = session
        .with_driver(&download_dir, async move |driver| {
            {
                download_custom_artifact(
                    driver,
                    session,
                    year,
                    report_name,
                    download_if_generating,
                    &wait_dir,
                    ArtifactFormat::Csv,
                )
                .await
                .and_then(|artifact| {
                    let table = parse_artifact(
                        &artifact.path,
                        ArtifactFormat::Csv,
                        &ParseOptions::default(),
                    )?;
                    std::fs::remove_file(&artifact.path)?;
                    Ok(table)
                })
            }
        })
        .await?;

    workdir.dispose()?;
    ensure_rows(table, &request, false)
}

/// Download a zip-bundled custom report and parse every member.
///
/// Returns member name (file stem) → table. Members whose names start with
/// a form number carry two banner rows around their header; plain members
/// use the default layout.
pub async fn download_zip_custom_report(
    session: &Session,
    year: &str,
    report_name: &str,
    download_if_generating: bool,
) -> Result<BTreeMap<String, Table>> {
    let workdir = session.provision_workdir(None)?;
    let download_dir = workdir.path().to_path_buf();
    let wait_dir = download_dir.clone();

    let tables = session
        .with_driver(&download_dir, async move |driver| {
            {
                let archive = download_custom_artifact(
                    driver,
                    session,
                    year,
                    report_name,
                    download_if_generating,
                    &wait_dir,
                    ArtifactFormat::Zip,
                )
                .await?;
                let unpack_dir = wait_dir.join("unpacked");
                let members = unpack_zip(&archive.path, &unpack_dir)?;
                std::fs::remove_file(&archive.path)?;

                let mut tables = BTreeMap::new();
                for member in members {
                    let Some(name) = member.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    let opts = member_parse_options(&member);
                    let table = parse_artifact(&member, ArtifactFormat::Csv, &opts)?;
                    if table.is_empty() {
                        warn!(member = name, "bundle member has no data rows");
                    }
                    tables.insert(name.to_string(), table);
                }
                if tables.is_empty() {
                    return Err(HarvestError::NoData(report_name.to_string()));
                }
                Ok(tables)
            }
        })
        .await?;

    workdir.dispose()?;
    Ok(tables)
}

/// Parse options for one bundle member: numbered form exports wrap their
/// header in banner rows at physical indexes 0 and 2.
pub fn member_parse_options(member: &Path) -> ParseOptions {
    let numbered = Regex::new(r"^\d+").unwrap();
    let stem = member
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if numbered.is_match(stem) {
        ParseOptions::default().with_skip_rows(vec![0, 2])
    } else {
        ParseOptions::default()
    }
}

/// Log in, apply the year, open the catalog, and locate the report row.
/// Returns the classified trigger state without clicking anything.
async fn open_custom_report_row(
    driver: &Driver,
    session: &Session,
    year: &str,
    report_name: &str,
) -> Result<TriggerOutcome> {
    let strategy = EnrollmentStrategy;
    login(driver, session, &strategy.login_spec(), None).await?;
    year_selector().apply(driver, session, year).await?;

    let url = interpret_report_url(&session.base_url, CUSTOM_REPORTS_PATH);
    driver.goto(&url).await?;
    dismiss_overlays(driver).await?;

    let catalog = custom_report_catalog();
    catalog.locate_row(driver, report_name).await?;
    let label = catalog.read_trigger_label(driver, report_name).await?;
    classify_trigger_label(&label)
}

#[allow(clippy::too_many_arguments)]
async fn download_custom_artifact(
    driver: &Driver,
    session: &Session,
    year: &str,
    report_name: &str,
    download_if_generating: bool,
    download_dir: &Path,
    format: ArtifactFormat,
) -> Result<Artifact> {
    let state = open_custom_report_row(driver, session, year, report_name).await?;
    if state == TriggerOutcome::AlreadyRunning && !download_if_generating {
        return Err(HarvestError::ReportNotReady(report_name.to_string()));
    }
    if state == TriggerOutcome::AlreadyRunning {
        warn!(
            report = report_name,
            "report is mid-generation, downloading last completed artifact"
        );
    }

    custom_report_catalog()
        .click_control(driver, report_name, ROW_DOWNLOAD_CONTROL)
        .await?;
    await_artifact(
        download_dir,
        Some(format),
        EnrollmentStrategy.download_timeout(),
        session.cancel_token(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_members_skip_their_banner_rows() {
        let opts = member_parse_options(Path::new("out/204 Enrollment Form.csv"));
        assert_eq!(opts.skip_rows, vec![0, 2]);

        let opts = member_parse_options(Path::new("out/Waitlist Summary.csv"));
        assert!(opts.skip_rows.is_empty());
        assert_eq!(opts.header_row, 0);
    }
}
