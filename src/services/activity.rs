//! Classroom-activity portal (email-relay variant).
//!
//! This portal never downloads through the browser. Triggering an export
//! emails a link to the account's mailbox, so the materialization wait is a
//! mailbox poll followed by an HTTP fetch of the linked CSV. The mailbox
//! poll budget is long (an hour by default) because the portal generates
//! these exports in a nightly-style batch queue.

use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use tracing::info;

use crate::browser::dom;
use crate::browser::session::Session;
use crate::core::error::{HarvestError, Result};
use crate::core::types::Table;
use crate::protocol::login::{login, LoginSpec, Marker, SubmitAction};
use crate::protocol::retry::{retry, RetryPolicy};
use crate::relay::{await_relay_link, fetch_csv_link, MailboxConfig, RelayQuery};
use crate::tabular::ParseOptions;

/// Mailbox poll budget: 15 polls, 4 minutes apart (one hour total).
pub const MAILBOX_POLLS: u32 = 15;
pub const MAILBOX_POLL_INTERVAL: Duration = Duration::from_secs(240);

/// The linked CSV sometimes resolves before the backing report has rows;
/// the fetch is retried while the result is empty.
const LINK_FETCH_RETRY: RetryPolicy = RetryPolicy::new(5, Duration::from_secs(30));

/// The relay CSV puts a title line above the header.
const RELAY_HEADER_ROW: usize = 1;

const EXPORT_MENU: &str = "a#admin-tools";
const EXPORT_ACTION: &str = "a#export-activity";
const EXPORT_CONFIRM: &str = "button.confirm-export";

fn link_pattern() -> Regex {
    // The delivery template always links the artifact from an assets host.
    Regex::new(r"https://assets\.[-a-z0-9.]+/\S+\.csv").unwrap()
}

fn login_spec() -> LoginSpec {
    LoginSpec::new(
        "/login",
        "input[name=email]",
        "input[name=password]",
        SubmitAction::EnterKey,
        Marker::Cookie("session_token".to_string()),
    )
}

/// Subject line the portal puts on the delivery email for one district and
/// export date.
pub fn report_subject(district: &str, date: NaiveDate) -> String {
    format!(
        "{district} activity export for {}",
        date.format("%A, %B %d, %Y")
    )
}

/// Trigger the export in the browser, then collect the emailed link and
/// fetch the artifact.
pub async fn download_activity_report(
    session: &Session,
    mailbox: &MailboxConfig,
    client: &reqwest::Client,
    district: &str,
    date: NaiveDate,
) -> Result<Table> {
    let workdir = session.provision_workdir(None)?;

    session
        .with_driver(workdir.path(), async move |driver| {
            {
                login(driver, session, &login_spec(), None).await?;
                let page = driver.page();
                let cancel = session.cancel_token();
                dom::click(page, EXPORT_MENU, session.wait_time, cancel).await?;
                dom::click(page, EXPORT_ACTION, session.wait_time, cancel).await?;
                dom::click(page, EXPORT_CONFIRM, session.wait_time, cancel).await?;
                info!(district, %date, "activity export triggered");
                Ok(())
            }
        })
        .await?;
    workdir.dispose()?;

    let query = RelayQuery {
        subject: report_subject(district, date),
        link_pattern: link_pattern(),
    };
    let link = await_relay_link(
        mailbox,
        &query,
        MAILBOX_POLLS,
        MAILBOX_POLL_INTERVAL,
        session.cancel_token(),
    )
    .await?;

    fetch_linked_report(client, &link).await
}

/// Fetch the linked CSV, retrying while the backing report has no rows.
pub async fn fetch_linked_report(client: &reqwest::Client, link: &str) -> Result<Table> {
    let opts = ParseOptions::default().with_header_row(RELAY_HEADER_ROW);
    retry(LINK_FETCH_RETRY, "relay-link-fetch", || {
        let opts = opts.clone();
        async move {
            let table = fetch_csv_link(client, link, &opts).await?;
            if table.is_empty() {
                // The link can resolve before the batch job finishes writing.
                return Err(HarvestError::ReportNotReady(link.to_string()));
            }
            Ok(table)
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_spells_out_the_date() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 7).unwrap();
        assert_eq!(
            report_subject("Lakeside USD", date),
            "Lakeside USD activity export for Friday, August 07, 2026"
        );
    }

    #[test]
    fn link_pattern_matches_the_delivery_template_only() {
        let pattern = link_pattern();
        assert!(pattern.is_match("https://assets.portal-cdn.example/exports/a1b2.csv"));
        assert!(!pattern.is_match("https://portal.example.com/exports/a1b2.csv"));
        assert!(!pattern.is_match("https://assets.portal-cdn.example/exports/a1b2.pdf"));
    }
}
