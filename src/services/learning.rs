//! Learning-platform portal.
//!
//! Login hands off to a third-party identity provider (two screens, second
//! credential pair optional). The data-downloads page scopes everything by
//! an academic-year picker whose labels use an en-dash, and shows a
//! Generate / Refresh / Download trio of controls whose presence depends on
//! whether the export was ever generated and whether it is stale.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::browser::dom;
use crate::browser::manager::Driver;
use crate::browser::session::Session;
use crate::core::error::{HarvestError, Result};
use crate::core::types::{ArtifactFormat, ReportRequest, Table};
use crate::protocol::login::{login, LoginSpec, Marker, SsoHop, SubmitAction};
use crate::protocol::report::{
    download_report, ensure_rows, interpret_report_url, ContextSelector, ReportStrategy,
};
use crate::protocol::wait::await_artifact;
use crate::tabular::{parse_artifact, ParseOptions};

const DATA_DOWNLOADS_PATH: &str = "/districts/data_downloads";
const MASTERY_THRESHOLD_PARAM: &str = "mastery_threshold";
const MASTERY_THRESHOLD_FIELD: &str = "input#mastery-threshold";
const ACTION_BUTTONS: &str = "div.download-card button, div.download-card a";
const GENERATE_LABEL: &str = "Generate";
const REFRESH_LABEL: &str = "Refresh";
const DOWNLOAD_LABEL: &str = "Download CSV";

/// Generation is quick but not instant; one refresh after this pause picks
/// up the finished export.
const REPORT_GENERATION_WAIT: Duration = Duration::from_secs(10);

/// Convert a plain `2025-2026` year into the en-dash form the picker shows.
pub fn academic_year_label(year: &str) -> String {
    year.replace('-', "\u{2013}")
}

fn year_selector() -> ContextSelector {
    ContextSelector {
        menu: "button#academic-year-picker".to_string(),
        options: "ul#academic-year-options li".to_string(),
        readback: "button#academic-year-picker span.selected-year".to_string(),
        settle: None,
    }
}

pub struct LearningStrategy;

#[async_trait]
impl ReportStrategy for LearningStrategy {
    fn service(&self) -> &str {
        "learning"
    }

    fn login_spec(&self) -> LoginSpec {
        LoginSpec::new(
            "/session/new",
            "input#login-email",
            "input#login-password",
            SubmitAction::Click("button#sign-in".to_string()),
            Marker::Element("nav#district-nav".to_string()),
        )
        .with_sso(SsoHop {
            username_field: "input[type=email]".to_string(),
            username_next: SubmitAction::Click("#identifierNext".to_string()),
            password_field: "input[type=password]".to_string(),
            password_next: SubmitAction::Click("#passwordNext".to_string()),
        })
    }

    fn context_selector(&self) -> Option<ContextSelector> {
        Some(year_selector())
    }

    /// The only recognized customization is the mastery-threshold
    /// percentage on progress reports; it is validated before the field is
    /// touched so a bad value never reaches the portal.
    async fn apply_parameters(
        &self,
        driver: &Driver,
        session: &Session,
        request: &ReportRequest,
    ) -> Result<()> {
        for (key, value) in &request.parameters {
            if key != MASTERY_THRESHOLD_PARAM {
                return Err(HarvestError::MalformedInput(format!(
                    "unrecognized report parameter {key:?}"
                )));
            }
            let threshold = parse_percentage(key, value)?;
            dom::fill_field(
                driver.page(),
                MASTERY_THRESHOLD_FIELD,
                &threshold.to_string(),
                session.wait_time,
                session.cancel_token(),
            )
            .await?;
            debug!(threshold, "mastery threshold applied");
        }
        Ok(())
    }
}

/// Parse a percentage parameter, rejecting anything outside 0..=100.
pub fn parse_percentage(key: &str, value: &str) -> Result<u8> {
    let parsed: i64 = value.trim().parse().map_err(|_| {
        HarvestError::MalformedInput(format!("{key} must be a whole number, got {value:?}"))
    })?;
    if (0..=100).contains(&parsed) {
        Ok(parsed as u8)
    } else {
        Err(HarvestError::MalformedInput(format!(
            "{key} must be between 0 and 100, got {parsed}"
        )))
    }
}

/// Download a report view directly by URL, scoped to `request.context` when
/// set. Uses the shared pipeline; the year label is en-dash-normalized by
/// the caller via [`academic_year_label`].
pub async fn download_url_report(session: &Session, request: &ReportRequest) -> Result<Table> {
    download_report(&LearningStrategy, session, request).await
}

/// Download the site-data export from the data-downloads page.
///
/// Button protocol: `Generate` means the export was never built for this
/// year; `Refresh` means a stale one exists. Either way the control is
/// clicked, the generation pause elapses, and the page is reloaded once so
/// the `Download CSV` control reflects the fresh export. A card with none
/// of the three controls means the portal changed its interface.
pub async fn download_site_data(session: &Session, academic_year: &str) -> Result<Table> {
    let year_label = academic_year_label(academic_year);
    let workdir = session.provision_workdir(None)?;
    let download_dir = workdir.path().to_path_buf();
    let wait_dir = download_dir.clone();

    let table = session
        .with_driver(&download_dir, async move |driver| {
            run_site_data_export(driver, session, year_label, wait_dir).await
        })
        .await?;

    workdir.dispose()?;
    let request = ReportRequest::new(DATA_DOWNLOADS_PATH);
    ensure_rows(table, &request, false)
}

async fn run_site_data_export(
    driver: &Driver,
    session: &Session,
    year_label: String,
    download_dir: std::path::PathBuf,
) -> Result<Table> {
    let strategy = LearningStrategy;
    login(driver, session, &strategy.login_spec(), None).await?;

    let url = interpret_report_url(&session.base_url, DATA_DOWNLOADS_PATH);
    driver.goto(&url).await?;
    year_selector().apply(driver, session, &year_label).await?;

    let page = driver.page();
    if dom::click_by_text(page, ACTION_BUTTONS, GENERATE_LABEL).await? {
        info!(year = %year_label, "site-data export generating");
        tokio::time::sleep(REPORT_GENERATION_WAIT).await;
        driver.goto(&url).await?;
        year_selector().verify(driver, session, &year_label).await?;
    } else if dom::click_by_text(page, ACTION_BUTTONS, REFRESH_LABEL).await? {
        debug!(year = %year_label, "refreshing stale site-data export");
        tokio::time::sleep(REPORT_GENERATION_WAIT).await;
        driver.goto(&url).await?;
        year_selector().verify(driver, session, &year_label).await?;
    }

    if !dom::click_by_text(page, ACTION_BUTTONS, DOWNLOAD_LABEL).await? {
        return Err(HarvestError::Browser(
            "data-downloads card offers no generate, refresh, or download control".into(),
        ));
    }

    let artifact = await_artifact(
        &download_dir,
        Some(ArtifactFormat::Csv),
        strategy.download_timeout(),
        session.cancel_token(),
    )
    .await?;
    let table = parse_artifact(&artifact.path, ArtifactFormat::Csv, &ParseOptions::default())?;
    std::fs::remove_file(&artifact.path)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn academic_year_gains_an_en_dash() {
        assert_eq!(academic_year_label("2025-2026"), "2025\u{2013}2026");
        // Already-correct labels pass through unchanged.
        assert_eq!(academic_year_label("2025\u{2013}2026"), "2025\u{2013}2026");
    }

    #[test]
    fn percentage_parameters_are_validated_before_any_portal_activity() {
        assert_eq!(parse_percentage("mastery_threshold", "85").unwrap(), 85);
        assert_eq!(parse_percentage("mastery_threshold", " 0 ").unwrap(), 0);
        assert_eq!(parse_percentage("mastery_threshold", "100").unwrap(), 100);

        for bad in ["101", "-1", "eighty", ""] {
            let err = parse_percentage("mastery_threshold", bad).unwrap_err();
            assert!(
                matches!(err, HarvestError::MalformedInput(_)),
                "{bad:?} should be rejected"
            );
        }
    }
}
