//! Student-roster portal.
//!
//! Two download paths: named collection exports through the regular report
//! pipeline, and a faster accounts export fetched by replaying the
//! authenticated browser session's cookies over plain HTTP.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::browser::dom;
use crate::browser::session::Session;
use crate::core::error::{HarvestError, Result};
use crate::core::types::{ReportRequest, Table};
use crate::protocol::login::{LoginSpec, Marker, SubmitAction};
use crate::protocol::report::{download_report, ensure_rows, interpret_report_url, ReportStrategy};
use crate::protocol::retry::{retry, RetryPolicy};
use crate::tabular::{parse_csv_bytes, ParseOptions};

/// Collections the portal exports. Anything else is rejected before any
/// browser activity.
pub const VALID_COLLECTIONS: &[&str] =
    &["schools", "students", "sections", "teachers", "schooladmins"];

/// The one collection that legitimately returns zero rows for small
/// districts.
const EMPTY_TOLERANT_COLLECTION: &str = "schooladmins";

/// The accounts export endpoint is flaky under load; the original cadence
/// is ten attempts a second apart with a little jitter.
const HTTP_RETRY: RetryPolicy =
    RetryPolicy::new(10, Duration::from_secs(1)).with_jitter(Duration::from_millis(500));

pub struct RosterStrategy;

#[async_trait]
impl ReportStrategy for RosterStrategy {
    fn service(&self) -> &str {
        "roster"
    }

    fn login_spec(&self) -> LoginSpec {
        LoginSpec::new(
            "/in",
            "input#username",
            "input#password",
            SubmitAction::Click("button[type=submit]".to_string()),
            Marker::TitleContains("Dashboard".to_string()),
        )
        .with_rejection_marker(Marker::TitleContains("Log in".to_string()))
    }

    fn empty_tolerant(&self, request: &ReportRequest) -> bool {
        request
            .report_url
            .ends_with(&format!("/{EMPTY_TOLERANT_COLLECTION}"))
    }
}

/// Validate a collection name against [`VALID_COLLECTIONS`].
pub fn validate_collection(collection: &str) -> Result<()> {
    if VALID_COLLECTIONS.contains(&collection) {
        Ok(())
    } else {
        Err(HarvestError::MalformedInput(format!(
            "unknown collection {collection:?}; expected one of {VALID_COLLECTIONS:?}"
        )))
    }
}

/// Download one named collection as a table.
pub async fn download_collection(session: &Session, collection: &str) -> Result<Table> {
    validate_collection(collection)?;
    let request = ReportRequest::new(format!("/data-browser/export/{collection}"));
    download_report(&RosterStrategy, session, &request).await
}

/// Download the accounts export by replaying session cookies over HTTP.
///
/// The browser only performs the login; the file transfer itself goes
/// through `client` with the browser's `Cookie` header attached, retried
/// per [`HTTP_RETRY`] because the endpoint intermittently 503s.
pub async fn download_accounts_export(
    session: &Session,
    client: &reqwest::Client,
    export_path: &str,
) -> Result<Table> {
    let workdir = session.provision_workdir(None)?;
    let export_url = interpret_report_url(&session.base_url, export_path);

    let table = session
        .with_driver(workdir.path(), async move |driver| {
            {
                let strategy = RosterStrategy;
                crate::protocol::login::login(driver, session, &strategy.login_spec(), None)
                    .await?;
                let cookies = dom::cookie_header(driver.page()).await?;
                info!(url = %export_url, "fetching accounts export over HTTP");

                let bytes = retry(HTTP_RETRY, "accounts-export", || {
                    let client = client.clone();
                    let export_url = export_url.clone();
                    let cookies = cookies.clone();
                    async move {
                        let response = client
                            .get(&export_url)
                            .header(reqwest::header::COOKIE, cookies)
                            .send()
                            .await?
                            .error_for_status()?;
                        Ok(response.bytes().await?)
                    }
                })
                .await?;

                parse_csv_bytes(&bytes, &ParseOptions::default())
            }
        })
        .await?;

    workdir.dispose()?;
    let request = ReportRequest::new(export_path);
    ensure_rows(table, &request, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_names_are_validated_up_front() {
        for name in VALID_COLLECTIONS {
            validate_collection(name).unwrap();
        }
        let err = validate_collection("stuednts").unwrap_err();
        assert!(matches!(err, HarvestError::MalformedInput(_)));
    }

    #[test]
    fn only_schooladmins_tolerates_zero_rows() {
        let strategy = RosterStrategy;
        let admins = ReportRequest::new("/data-browser/export/schooladmins");
        let students = ReportRequest::new("/data-browser/export/students");
        assert!(strategy.empty_tolerant(&admins));
        assert!(!strategy.empty_tolerant(&students));
    }
}
