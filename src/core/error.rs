use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// What a polling wait was watching for when it ran out of budget.
///
/// Kept separate so callers can tell "the login marker never rendered" apart
/// from "the export never landed on disk" and "the relay email never arrived",
/// each of which has an independently configured budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Element,
    File,
    Message,
}

impl fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WaitTarget::Element => "page element",
            WaitTarget::File => "downloaded file",
            WaitTarget::Message => "mailbox message",
        };
        f.write_str(s)
    }
}

/// Error taxonomy for the download-orchestration protocol.
///
/// Retry classification lives on [`HarvestError::is_transient`]; the retry
/// layer never inspects variants directly.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Login explicitly rejected (or the success marker never appeared after
    /// submitting credentials). Never retried.
    #[error("invalid login credentials for {service}")]
    InvalidCredentials { service: String },

    /// A named report, collection, or row was not located after exhausting
    /// navigation/search.
    #[error("report not found: {0}")]
    ReportNotFound(String),

    /// The report exists but the portal is still generating it.
    #[error("report is still generating: {0}")]
    ReportNotReady(String),

    /// Artifact parsed cleanly but held zero data rows where data was expected.
    #[error("no data rows in report: {0}")]
    NoData(String),

    /// A polling wait exceeded its budget.
    #[error("{what} did not appear within {waited:?}")]
    Timeout { what: WaitTarget, waited: Duration },

    /// Element not interactable / not found due to a race with page rendering.
    #[error("transient UI failure: {0}")]
    TransientUi(String),

    /// Caller-supplied parameter failed validation. Raised before any
    /// browser or network activity.
    #[error("invalid parameter: {0}")]
    MalformedInput(String),

    /// A stateful context selector (school year, district profile) did not
    /// take effect: the read-back shows a different value than was selected.
    #[error("context selector shows {actual:?} after selecting {expected:?}")]
    ContextMismatch { expected: String, actual: String },

    /// A retry budget ran out. Distinct from the final attempt's own error so
    /// callers can log "gave up after N tries" separately.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<HarvestError>,
    },

    /// The caller's cancellation token fired mid-operation.
    #[error("operation cancelled")]
    Cancelled,

    #[error("browser error: {0}")]
    Browser(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("mailbox error: {0}")]
    Mailbox(String),

    #[error("artifact parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarvestError>;

impl HarvestError {
    /// Whether the retry layer may re-run the failed step.
    ///
    /// Terminal conditions (rejected credentials, malformed input, a report
    /// that simply is not there) abort immediately; everything rooted in
    /// rendering races, slow report generation, or flaky transports may be
    /// retried up to the call site's budget.
    pub fn is_transient(&self) -> bool {
        match self {
            HarvestError::TransientUi(_)
            | HarvestError::ReportNotReady(_)
            | HarvestError::Timeout { .. }
            | HarvestError::Mailbox(_) => true,
            HarvestError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }

    /// Shorthand for wrapping a CDP / driver failure.
    pub fn browser(err: impl fmt::Display) -> Self {
        HarvestError::Browser(err.to_string())
    }

    /// Shorthand for a rendering-race failure that the retry layer may re-run.
    pub fn transient(err: impl fmt::Display) -> Self {
        HarvestError::TransientUi(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(HarvestError::TransientUi("stale element".into()).is_transient());
        assert!(HarvestError::ReportNotReady("weekly".into()).is_transient());
        assert!(HarvestError::Timeout {
            what: WaitTarget::File,
            waited: Duration::from_secs(60)
        }
        .is_transient());

        assert!(!HarvestError::InvalidCredentials {
            service: "roster".into()
        }
        .is_transient());
        assert!(!HarvestError::MalformedInput("bad collection".into()).is_transient());
        assert!(!HarvestError::ReportNotFound("weekly".into()).is_transient());
        assert!(!HarvestError::NoData("weekly".into()).is_transient());
    }

    #[test]
    fn exhausted_error_preserves_last_attempt() {
        let inner = HarvestError::TransientUi("button not clickable".into());
        let err = HarvestError::RetriesExhausted {
            attempts: 5,
            source: Box::new(inner),
        };
        let msg = err.to_string();
        assert!(msg.contains("5 attempts"));
        assert!(msg.contains("button not clickable"));
        // The exhausted wrapper itself is terminal.
        assert!(!err.is_transient());
    }
}
