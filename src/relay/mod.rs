//! Email-relay report delivery.
//!
//! One portal never materializes exports in the browser: triggering a report
//! emails a download link to the account's mailbox. This module polls that
//! mailbox over IMAP, extracts the link from the newest matching message,
//! and fetches the artifact over HTTP.
//!
//! The IMAP client is blocking, so every mailbox round trip runs inside
//! `tokio::task::spawn_blocking`.

use std::fmt;
use std::time::Duration;

use mailparse::MailHeaderMap;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::error::{HarvestError, Result, WaitTarget};
use crate::core::types::Table;
use crate::tabular::{parse_csv_bytes, ParseOptions};

/// IMAP endpoint and credentials for the relay mailbox.
///
/// `Debug` redacts the password, same as
/// [`Credentials`](crate::core::types::Credentials).
#[derive(Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Folder to search; "INBOX" for every known portal.
    pub folder: String,
}

impl MailboxConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 993,
            username: username.into(),
            password: password.into(),
            folder: "INBOX".to_string(),
        }
    }
}

impl fmt::Debug for MailboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("folder", &self.folder)
            .finish()
    }
}

/// What to look for in the mailbox.
#[derive(Debug, Clone)]
pub struct RelayQuery {
    /// Exact subject line the portal puts on the delivery message.
    pub subject: String,
    /// Pattern matching the artifact link inside the message body.
    pub link_pattern: Regex,
}

/// Poll the mailbox until a message with the query subject carries a link,
/// or the poll budget runs out.
///
/// `polls` attempts are made, `interval` apart; exhaustion is
/// `Timeout { what: Message }`. The newest matching message wins when the
/// subject matches several.
pub async fn await_relay_link(
    config: &MailboxConfig,
    query: &RelayQuery,
    polls: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    info!(
        subject = %query.subject,
        polls,
        interval = ?interval,
        "polling relay mailbox"
    );
    for poll in 1..=polls {
        if cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        let config = config.clone();
        let subject = query.subject.clone();
        let body = tokio::task::spawn_blocking(move || fetch_most_recent_matching(&config, &subject))
            .await
            .map_err(|e| HarvestError::Mailbox(format!("mailbox task panicked: {e}")))??;

        if let Some(body) = body {
            if let Some(link) = extract_link(&query.link_pattern, &body) {
                debug!(poll, "relay link found");
                return Ok(link);
            }
            debug!(poll, "matching message holds no link yet");
        } else {
            debug!(poll, "no matching message yet");
        }

        if poll < polls {
            tokio::time::sleep(interval).await;
        }
    }
    Err(HarvestError::Timeout {
        what: WaitTarget::Message,
        waited: interval * polls,
    })
}

/// First link in `body` matching `pattern`.
pub fn extract_link(pattern: &Regex, body: &str) -> Option<String> {
    pattern.find(body).map(|m| m.as_str().to_string())
}

/// One blocking IMAP round trip: connect, search by subject, return the
/// plain-text body of the newest matching message.
fn fetch_most_recent_matching(config: &MailboxConfig, subject: &str) -> Result<Option<String>> {
    let tls = native_tls::TlsConnector::new()
        .map_err(|e| HarvestError::Mailbox(format!("TLS setup: {e}")))?;
    let client = imap::connect((config.host.as_str(), config.port), &config.host, &tls)
        .map_err(|e| HarvestError::Mailbox(format!("connect {}: {e}", config.host)))?;
    let mut session = client
        .login(&config.username, &config.password)
        .map_err(|(e, _)| HarvestError::Mailbox(format!("login: {e}")))?;

    let result = (|| {
        session
            .select(&config.folder)
            .map_err(|e| HarvestError::Mailbox(format!("select {}: {e}", config.folder)))?;
        // Subject quoting: IMAP literals would be more robust, but every
        // known subject line is plain ASCII without quotes.
        let ids = session
            .search(format!("SUBJECT {}", quote_imap(subject)))
            .map_err(|e| HarvestError::Mailbox(format!("search: {e}")))?;
        if ids.is_empty() {
            return Ok(None);
        }

        let sequence = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let messages = session
            .fetch(sequence, "RFC822")
            .map_err(|e| HarvestError::Mailbox(format!("fetch: {e}")))?;

        let raws: Vec<&[u8]> = messages.iter().filter_map(|m| m.body()).collect();
        newest_message_body(&raws)
    })();

    let _ = session.logout();
    result
}

fn quote_imap(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Pick the newest raw message by `Date` header, then extract its
/// plain-text body. Recency and extractability are decided in that order:
/// when the newest matching message has no text/plain part, that is a
/// mailbox error, not a reason to quietly hand back an older message's
/// body.
fn newest_message_body(raws: &[&[u8]]) -> Result<Option<String>> {
    let mut newest: Option<(i64, &[u8])> = None;
    for &raw in raws {
        let parsed = mailparse::parse_mail(raw)
            .map_err(|e| HarvestError::Mailbox(format!("message parse: {e}")))?;
        let date = parsed
            .headers
            .get_first_value("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .unwrap_or(0);
        let keep = match &newest {
            Some((best, _)) => date > *best,
            None => true,
        };
        if keep {
            newest = Some((date, raw));
        }
    }
    let Some((_, raw)) = newest else {
        return Ok(None);
    };
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| HarvestError::Mailbox(format!("message parse: {e}")))?;
    match plain_text_part(&parsed)? {
        Some(text) => Ok(Some(text)),
        None => Err(HarvestError::Mailbox(
            "newest matching message has no text/plain part".into(),
        )),
    }
}

/// Depth-first search for the first `text/plain` part of a message.
fn plain_text_part(mail: &mailparse::ParsedMail<'_>) -> Result<Option<String>> {
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.eq_ignore_ascii_case("text/plain") {
            let body = mail
                .get_body()
                .map_err(|e| HarvestError::Mailbox(format!("body decode: {e}")))?;
            return Ok(Some(body));
        }
        return Ok(None);
    }
    for part in &mail.subparts {
        if let Some(text) = plain_text_part(part)? {
            return Ok(Some(text));
        }
    }
    Ok(None)
}

/// Fetch a relay-delivered CSV link and parse it.
pub async fn fetch_csv_link(
    client: &reqwest::Client,
    link: &str,
    opts: &ParseOptions,
) -> Result<Table> {
    debug!(link, "fetching relay artifact");
    let response = client.get(link).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    parse_csv_bytes(&bytes, opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPART: &str = "From: reports@portal.example.com\r\n\
Subject: Your report is ready\r\n\
Date: Mon, 03 Aug 2026 09:15:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"sep\"\r\n\
\r\n\
--sep\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Download here: https://assets.portal.example.com/exports/week.csv\r\n\
--sep\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<a href=\"https://assets.portal.example.com/exports/week.csv\">link</a>\r\n\
--sep--\r\n";

    #[test]
    fn plain_text_part_is_found_in_multipart_mail() {
        let parsed = mailparse::parse_mail(MULTIPART.as_bytes()).unwrap();
        let text = plain_text_part(&parsed).unwrap().unwrap();
        assert!(text.contains("Download here"));
        assert!(!text.contains("<a href"));
    }

    #[test]
    fn link_pattern_extracts_the_artifact_address() {
        let pattern = Regex::new(r"https://assets\.[-a-z0-9.]+/\S+\.csv").unwrap();
        let body = "Your weekly export is ready.\n\
                    Download here: https://assets.portal.example.com/exports/week.csv\n\
                    This link expires in 7 days.";
        assert_eq!(
            extract_link(&pattern, body).unwrap(),
            "https://assets.portal.example.com/exports/week.csv"
        );
        assert!(extract_link(&pattern, "no link in here").is_none());
    }

    fn plain_mail(date: &str, body: &str) -> Vec<u8> {
        format!(
            "From: reports@portal.example.com\r\n\
             Subject: Your report is ready\r\n\
             Date: {date}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             {body}\r\n"
        )
        .into_bytes()
    }

    fn html_only_mail(date: &str) -> Vec<u8> {
        format!(
            "From: reports@portal.example.com\r\n\
             Subject: Your report is ready\r\n\
             Date: {date}\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             <p>see attachment</p>\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn newest_message_wins_by_date_header() {
        let old = plain_mail("Mon, 03 Aug 2026 09:15:00 +0000", "old link");
        let new = plain_mail("Tue, 04 Aug 2026 09:15:00 +0000", "new link");
        // Mailbox order is not date order.
        let raws: Vec<&[u8]> = vec![new.as_slice(), old.as_slice()];
        let body = newest_message_body(&raws).unwrap().unwrap();
        assert!(body.contains("new link"));
    }

    #[test]
    fn unreadable_newest_message_never_falls_back_to_an_older_body() {
        let old = plain_mail("Mon, 03 Aug 2026 09:15:00 +0000", "old link");
        let new = html_only_mail("Tue, 04 Aug 2026 09:15:00 +0000");
        let raws: Vec<&[u8]> = vec![old.as_slice(), new.as_slice()];
        let err = newest_message_body(&raws).unwrap_err();
        match err {
            HarvestError::Mailbox(msg) => assert!(msg.contains("no text/plain")),
            other => panic!("expected Mailbox error, got {other}"),
        }
    }

    #[test]
    fn no_messages_means_no_body_not_an_error() {
        assert!(newest_message_body(&[]).unwrap().is_none());
    }

    #[test]
    fn imap_subject_quoting_escapes_embedded_quotes() {
        assert_eq!(quote_imap("plain subject"), "\"plain subject\"");
        assert_eq!(quote_imap("has \"quotes\""), "\"has \\\"quotes\\\"\"");
    }

    #[test]
    fn mailbox_debug_redacts_password() {
        let cfg = MailboxConfig::new("imap.example.com", "reports@example.com", "hunter2");
        let debug = format!("{cfg:?}");
        assert!(debug.contains("imap.example.com"));
        assert!(!debug.contains("hunter2"));
    }
}
