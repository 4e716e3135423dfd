//! Declarative login flow.
//!
//! Each service describes its portal's login page as a [`LoginSpec`]; one
//! driver function runs the fill/submit/verify state machine for all of them.
//! Outcome classification is deliberately strict: once credentials are
//! submitted, anything short of the success marker within the wait budget is
//! reported as [`HarvestError::InvalidCredentials`], never a generic timeout,
//! so callers never retry a rejected password.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::browser::dom;
use crate::browser::manager::Driver;
use crate::browser::session::Session;
use crate::core::error::{HarvestError, Result};
use crate::core::types::Credentials;

use super::retry::{retry, RetryPolicy};

/// Interval between post-submit outcome checks.
const OUTCOME_POLL: Duration = Duration::from_millis(500);

/// An observable page condition that signals a login outcome.
#[derive(Debug, Clone)]
pub enum Marker {
    /// A CSS selector that matches once the condition holds.
    Element(String),
    /// The document title contains this substring.
    TitleContains(String),
    /// A session cookie with this name exists.
    Cookie(String),
}

impl Marker {
    async fn holds(&self, driver: &Driver) -> Result<bool> {
        match self {
            Marker::Element(selector) => {
                Ok(dom::try_find(driver.page(), selector).await.is_some())
            }
            Marker::TitleContains(fragment) => {
                Ok(dom::page_title(driver.page()).await?.contains(fragment))
            }
            Marker::Cookie(name) => dom::has_cookie(driver.page(), name).await,
        }
    }
}

/// How a filled form is submitted.
#[derive(Debug, Clone)]
pub enum SubmitAction {
    /// Press Enter in the password field.
    EnterKey,
    /// Click this CSS selector.
    Click(String),
}

/// A second credential screen reached after the primary form, as with portals
/// that delegate to an identity provider.
#[derive(Debug, Clone)]
pub struct SsoHop {
    pub username_field: String,
    pub username_next: SubmitAction,
    pub password_field: String,
    pub password_next: SubmitAction,
}

/// Everything the state machine needs to know about one portal's login page.
#[derive(Debug, Clone)]
pub struct LoginSpec {
    /// Path under the session base URL, or a fully-qualified address.
    pub login_path: String,
    pub username_field: String,
    pub password_field: String,
    pub submit: SubmitAction,
    /// Condition proving the authenticated landing page rendered.
    pub success_marker: Marker,
    /// Condition proving the portal rejected the credentials. Optional:
    /// some portals only re-render the blank form.
    pub rejection_marker: Option<Marker>,
    /// Identity-provider hop, when the primary form redirects to one.
    pub sso: Option<SsoHop>,
    /// Budget for the fill-and-submit phase. Rendering races while filling
    /// the form are transient; rejection afterwards is not.
    pub form_retry: RetryPolicy,
}

impl LoginSpec {
    pub fn new(
        login_path: impl Into<String>,
        username_field: impl Into<String>,
        password_field: impl Into<String>,
        submit: SubmitAction,
        success_marker: Marker,
    ) -> Self {
        Self {
            login_path: login_path.into(),
            username_field: username_field.into(),
            password_field: password_field.into(),
            submit,
            success_marker,
            rejection_marker: None,
            sso: None,
            form_retry: RetryPolicy::default(),
        }
    }

    pub fn with_rejection_marker(mut self, marker: Marker) -> Self {
        self.rejection_marker = Some(marker);
        self
    }

    pub fn with_sso(mut self, sso: SsoHop) -> Self {
        self.sso = Some(sso);
        self
    }

    pub fn with_form_retry(mut self, policy: RetryPolicy) -> Self {
        self.form_retry = policy;
        self
    }

    fn login_url(&self, session: &Session) -> String {
        super::report::interpret_report_url(&session.base_url, &self.login_path)
    }
}

/// Navigate to the login page, submit credentials, and verify the outcome.
///
/// `sso_credentials` feeds the identity-provider hop when `spec.sso` is set;
/// `None` reuses the session credentials there.
pub async fn login(
    driver: &Driver,
    session: &Session,
    spec: &LoginSpec,
    sso_credentials: Option<&Credentials>,
) -> Result<()> {
    let url = spec.login_url(session);
    info!(service = %session.service, url = %url, "logging in");

    retry(spec.form_retry, "login-form", || async {
        driver.goto(&url).await?;
        submit_credentials(driver, session, spec).await
    })
    .await?;

    if let Some(sso) = &spec.sso {
        let creds = sso_credentials.unwrap_or(&session.credentials);
        submit_sso_hop(driver, session, sso, creds).await?;
    }

    await_outcome(driver, session, spec).await
}

async fn submit_credentials(driver: &Driver, session: &Session, spec: &LoginSpec) -> Result<()> {
    let page = driver.page();
    let cancel = session.cancel_token();
    dom::fill_field(
        page,
        &spec.username_field,
        &session.credentials.username,
        session.wait_time,
        cancel,
    )
    .await?;
    let password = dom::wait_for_element(page, &spec.password_field, session.wait_time, cancel)
        .await?;
    password.click().await.map_err(HarvestError::transient)?;
    password
        .type_str(&session.credentials.password)
        .await
        .map_err(HarvestError::transient)?;

    match &spec.submit {
        SubmitAction::EnterKey => dom::press_enter(&password).await,
        SubmitAction::Click(selector) => {
            dom::click(page, selector, session.wait_time, cancel).await
        }
    }
}

async fn submit_sso_hop(
    driver: &Driver,
    session: &Session,
    sso: &SsoHop,
    creds: &Credentials,
) -> Result<()> {
    debug!(service = %session.service, "identity-provider hop");
    let page = driver.page();
    let cancel = session.cancel_token();

    dom::fill_field(page, &sso.username_field, &creds.username, session.wait_time, cancel).await?;
    advance(driver, session, &sso.username_next, &sso.username_field).await?;

    dom::fill_field(page, &sso.password_field, &creds.password, session.wait_time, cancel).await?;
    advance(driver, session, &sso.password_next, &sso.password_field).await?;
    Ok(())
}

async fn advance(
    driver: &Driver,
    session: &Session,
    action: &SubmitAction,
    field: &str,
) -> Result<()> {
    let page = driver.page();
    let cancel = session.cancel_token();
    match action {
        SubmitAction::EnterKey => {
            let element = dom::wait_for_element(page, field, session.wait_time, cancel).await?;
            dom::press_enter(&element).await
        }
        SubmitAction::Click(selector) => dom::click(page, selector, session.wait_time, cancel).await,
    }
}

/// Poll for the success or rejection marker until the wait budget elapses.
///
/// Budget exhaustion without the success marker is treated as a rejected
/// login: the portal had its chance to render the landing page.
async fn await_outcome(driver: &Driver, session: &Session, spec: &LoginSpec) -> Result<()> {
    let start = Instant::now();
    loop {
        if session.cancel_token().is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        if let Some(rejection) = &spec.rejection_marker {
            if rejection.holds(driver).await? {
                return Err(HarvestError::InvalidCredentials {
                    service: session.service.clone(),
                });
            }
        }
        if spec.success_marker.holds(driver).await? {
            info!(service = %session.service, "login verified");
            return Ok(());
        }
        if start.elapsed() >= session.wait_time {
            return Err(HarvestError::InvalidCredentials {
                service: session.service.clone(),
            });
        }
        tokio::time::sleep(OUTCOME_POLL).await;
    }
}
