//! Report trigger and materialization protocol.
//!
//! [`ReportStrategy`] is the seam between the shared download pipeline and
//! each portal's quirks: a service implements the trait, and
//! [`download_report`] runs the whole login → context → trigger → wait →
//! parse → clean-up sequence around it.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::dom;
use crate::browser::manager::Driver;
use crate::browser::session::Session;
use crate::core::error::{HarvestError, Result};
use crate::core::types::{ArtifactFormat, ReportRequest, Table, TriggerOutcome};
use crate::tabular::{parse_artifact, ParseOptions};

use super::login::{login, LoginSpec};
use super::wait::await_artifact;

// ── URL interpretation ───────────────────────────────────────────────────────

/// Resolve a report address against the portal base URL.
///
/// Three accepted shapes:
/// * fully qualified and under the base → used verbatim
/// * leading slash → appended to the base origin
/// * bare fragment → appended with a separating slash
pub fn interpret_report_url(base: &Url, report_url: &str) -> String {
    let base = base.as_str().trim_end_matches('/');
    if report_url.starts_with(base) {
        report_url.to_string()
    } else if report_url.starts_with('/') {
        format!("{base}{report_url}")
    } else {
        format!("{base}/{report_url}")
    }
}

// ── Stateful context selection ───────────────────────────────────────────────

/// A dropdown-style portal control that scopes every report on the site
/// (school year, district profile). Selection is verified by reading the
/// control back, because these portals apply the change asynchronously.
#[derive(Debug, Clone)]
pub struct ContextSelector {
    /// The control that opens the option list.
    pub menu: String,
    /// Selector matching the individual options.
    pub options: String,
    /// Element whose text shows the currently active context.
    pub readback: String,
    /// Element that must render before the read-back is trustworthy.
    pub settle: Option<String>,
}

impl ContextSelector {
    /// Open the menu, click the option whose text contains `value`, wait for
    /// the page to settle, then verify the read-back.
    pub async fn apply(&self, driver: &Driver, session: &Session, value: &str) -> Result<()> {
        info!(service = %session.service, context = value, "selecting context");
        let page = driver.page();
        let cancel = session.cancel_token();

        dom::click(page, &self.menu, session.wait_time, cancel).await?;
        let clicked = dom::click_by_text(page, &self.options, value).await?;
        if !clicked {
            return Err(HarvestError::MalformedInput(format!(
                "context {value:?} is not offered by the portal"
            )));
        }
        if let Some(settle) = &self.settle {
            dom::wait_for_element(page, settle, session.wait_time, cancel).await?;
        }
        self.verify(driver, session, value).await
    }

    /// Read the control back and require it to show `value`.
    pub async fn verify(&self, driver: &Driver, session: &Session, value: &str) -> Result<()> {
        let element = dom::wait_for_element(
            driver.page(),
            &self.readback,
            session.wait_time,
            session.cancel_token(),
        )
        .await?;
        let shown = dom::element_text(&element).await?;
        check_context(&shown, value)?;
        debug!(shown = %shown, "context read-back verified");
        Ok(())
    }
}

/// Classify a context read-back against the value that was selected.
///
/// Pure so the mismatch branch is testable without a browser. The read-back
/// text may carry decoration around the value ("School Year: 2026-2027"),
/// so containment is the match rule.
pub fn check_context(shown: &str, expected: &str) -> Result<()> {
    if shown.contains(expected) {
        Ok(())
    } else {
        Err(HarvestError::ContextMismatch {
            expected: expected.to_string(),
            actual: shown.to_string(),
        })
    }
}

// ── Paginated report lists ───────────────────────────────────────────────────

/// A report catalog rendered as a paginated table, with per-row trigger and
/// download controls.
#[derive(Debug, Clone)]
pub struct PaginatedList {
    /// Selector for the pagination links carrying a `data-page` attribute.
    pub page_links: String,
    /// Selector for the rows of the catalog table.
    pub rows: String,
}

impl PaginatedList {
    /// Number of catalog pages; a catalog without pagination links is one page.
    pub async fn page_count(&self, driver: &Driver) -> Result<u64> {
        let js = format!(
            "(() => {{ \
               const links = Array.from(document.querySelectorAll({sel})); \
               const pages = links \
                 .map(l => parseInt(l.getAttribute('data-page'), 10)) \
                 .filter(n => !isNaN(n)); \
               return pages.length ? Math.max(...pages) : 1; \
             }})()",
            sel = dom::js_string(&self.page_links),
        );
        Ok(dom::eval_u64(driver.page(), js).await?.max(1))
    }

    async fn open_page(&self, driver: &Driver, number: u64) -> Result<bool> {
        let js = format!(
            "(() => {{ \
               const link = Array.from(document.querySelectorAll({sel})) \
                 .find(l => l.getAttribute('data-page') === {num}); \
               if (!link) return false; \
               link.click(); \
               return true; \
             }})()",
            sel = dom::js_string(&self.page_links),
            num = dom::js_string(&number.to_string()),
        );
        dom::eval_bool(driver.page(), js).await
    }

    /// Walk the catalog pages until a row whose first cell equals `name` is
    /// on screen. Exhausting every page is [`HarvestError::ReportNotFound`].
    pub async fn locate_row(&self, driver: &Driver, name: &str) -> Result<()> {
        let pages = self.page_count(driver).await?;
        for page_no in 1..=pages {
            if page_no > 1 && !self.open_page(driver, page_no).await? {
                break;
            }
            if self.row_on_screen(driver, name).await? {
                debug!(report = name, page = page_no, "report row located");
                return Ok(());
            }
        }
        Err(HarvestError::ReportNotFound(name.to_string()))
    }

    async fn row_on_screen(&self, driver: &Driver, name: &str) -> Result<bool> {
        let js = format!(
            "(() => {{ \
               const rows = Array.from(document.querySelectorAll({rows})); \
               return rows.some(r => {{ \
                 const cell = r.querySelector('td'); \
                 return cell && cell.textContent.trim() === {name}; \
               }}); \
             }})()",
            rows = dom::js_string(&self.rows),
            name = dom::js_string(name),
        );
        dom::eval_bool(driver.page(), js).await
    }

    /// Text of the trigger control in the located report's row.
    pub async fn read_trigger_label(&self, driver: &Driver, name: &str) -> Result<String> {
        let js = self.row_control_js(name, "return ctl.textContent.trim();", "''");
        let label = dom::eval_string(driver.page(), js).await?;
        if label.is_empty() {
            return Err(HarvestError::ReportNotFound(name.to_string()));
        }
        Ok(label)
    }

    /// Click the trigger control in the located report's row.
    pub async fn click_trigger(&self, driver: &Driver, name: &str) -> Result<()> {
        let js = self.row_control_js(name, "ctl.click(); return true;", "false");
        if dom::eval_bool(driver.page(), js).await? {
            Ok(())
        } else {
            Err(HarvestError::ReportNotFound(name.to_string()))
        }
    }

    /// Click an arbitrary control inside the located report's row.
    pub async fn click_control(&self, driver: &Driver, name: &str, control: &str) -> Result<()> {
        let js = self.named_control_js(name, control, "ctl.click(); return true;", "false");
        if dom::eval_bool(driver.page(), js).await? {
            Ok(())
        } else {
            Err(HarvestError::ReportNotFound(name.to_string()))
        }
    }

    fn row_control_js(&self, name: &str, on_found: &str, on_missing: &str) -> String {
        self.named_control_js(name, "button, a", on_found, on_missing)
    }

    fn named_control_js(
        &self,
        name: &str,
        control: &str,
        on_found: &str,
        on_missing: &str,
    ) -> String {
        format!(
            "(() => {{ \
               const rows = Array.from(document.querySelectorAll({rows})); \
               const row = rows.find(r => {{ \
                 const cell = r.querySelector('td'); \
                 return cell && cell.textContent.trim() === {name}; \
               }}); \
               if (!row) return {on_missing}; \
               const ctl = row.querySelector({control}); \
               if (!ctl) return {on_missing}; \
               {on_found} \
             }})()",
            rows = dom::js_string(&self.rows),
            name = dom::js_string(name),
            control = dom::js_string(control),
        )
    }
}

/// Interpret the label on a report-row trigger control.
///
/// Pure classification so it can be tested without a browser. Unknown labels
/// are an error: the portal changed its interface and silently clicking
/// would trigger an unknown action.
pub fn classify_trigger_label(label: &str) -> Result<TriggerOutcome> {
    match label.trim() {
        "Generate Report" => Ok(TriggerOutcome::Started),
        "Report in Progress" => Ok(TriggerOutcome::AlreadyRunning),
        other => Err(HarvestError::Browser(format!(
            "unrecognized report trigger label: {other:?}"
        ))),
    }
}

// ── Stabilization wait ───────────────────────────────────────────────────────

/// Interval between the two reads of a stabilizing element.
const STABLE_READ_GAP: Duration = Duration::from_secs(3);

/// Wait until an element's text stops changing: two reads, [`STABLE_READ_GAP`]
/// apart, must agree. Used for counters that tick while a portal loads rows.
pub async fn wait_for_stable_text(
    driver: &Driver,
    selector: &str,
    session: &Session,
) -> Result<String> {
    let page = driver.page();
    let cancel = session.cancel_token();
    let deadline = std::time::Instant::now() + session.wait_time;
    let element = dom::wait_for_element(page, selector, session.wait_time, cancel).await?;
    let mut previous = dom::element_text(&element).await?;
    loop {
        if cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        tokio::time::sleep(STABLE_READ_GAP).await;
        let element = dom::wait_for_element(page, selector, session.wait_time, cancel).await?;
        let current = dom::element_text(&element).await?;
        if current == previous {
            return Ok(current);
        }
        if std::time::Instant::now() >= deadline {
            return Err(HarvestError::transient(format!(
                "text of {selector} never stabilized (last read {current:?})"
            )));
        }
        previous = current;
    }
}

// ── The strategy seam ────────────────────────────────────────────────────────

/// Per-portal description of how one class of reports is fetched.
///
/// The defaults cover the common case where navigating to the report URL is
/// itself the export trigger; portals with filter controls, generate
/// buttons, or multi-step dialogs override the relevant steps.
#[async_trait]
pub trait ReportStrategy: Send + Sync {
    /// Short service tag for logs and errors.
    fn service(&self) -> &str;

    fn login_spec(&self) -> LoginSpec;

    fn artifact_format(&self) -> ArtifactFormat {
        ArtifactFormat::Csv
    }

    fn parse_options(&self, _request: &ReportRequest) -> ParseOptions {
        ParseOptions::default()
    }

    /// Budget for the on-disk materialization wait.
    fn download_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Whether a zero-row result for this request is legitimate.
    fn empty_tolerant(&self, _request: &ReportRequest) -> bool {
        false
    }

    /// The portal's stateful context control, if it has one.
    fn context_selector(&self) -> Option<ContextSelector> {
        None
    }

    /// Open the report view. The default navigates to the interpreted
    /// report URL; for the simplest portals that navigation alone starts
    /// the download.
    async fn open_report(
        &self,
        driver: &Driver,
        session: &Session,
        request: &ReportRequest,
    ) -> Result<()> {
        let url = interpret_report_url(&session.base_url, &request.report_url);
        driver.goto(&url).await
    }

    /// Apply `request.parameters` to the opened report view before the
    /// export is triggered. The default accepts only an empty parameter
    /// map: a strategy that never reads parameters must not let a caller
    /// believe its customization took effect.
    async fn apply_parameters(
        &self,
        _driver: &Driver,
        _session: &Session,
        request: &ReportRequest,
    ) -> Result<()> {
        ensure_no_parameters(self.service(), request)
    }

    /// Invoke the export action on the opened report view. Postcondition:
    /// the portal has started writing the artifact into the session's
    /// download directory. The default does nothing because opening the
    /// view already triggered the download.
    async fn trigger_export(
        &self,
        _driver: &Driver,
        _session: &Session,
        _request: &ReportRequest,
    ) -> Result<()> {
        Ok(())
    }
}

/// Run the full download pipeline for one request.
///
/// Steps: provision workdir → login → apply context (when requested) →
/// open the report view → apply parameters → trigger → wait for the
/// artifact → parse → delete the artifact → dispose
/// of a disposable workdir. The browser is closed on every path; the
/// artifact file never outlives the call unless the caller supplied a
/// persistent output directory, in which case only the directory survives.
pub async fn download_report(
    strategy: &dyn ReportStrategy,
    session: &Session,
    request: &ReportRequest,
) -> Result<Table> {
    let workdir = session.provision_workdir(request.output_dir.as_deref())?;
    let download_dir = workdir.path().to_path_buf();
    let wait_dir = download_dir.clone();

    let table = session
        .with_driver(&download_dir, async move |driver| {
            {
                login(driver, session, &strategy.login_spec(), None).await?;

                if let Some(context) = &request.context {
                    let selector = strategy.context_selector().ok_or_else(|| {
                        HarvestError::MalformedInput(format!(
                            "{} has no context selector but context {context:?} was requested",
                            strategy.service()
                        ))
                    })?;
                    selector.apply(driver, session, context).await?;
                }

                strategy.open_report(driver, session, request).await?;
                strategy.apply_parameters(driver, session, request).await?;
                strategy.trigger_export(driver, session, request).await?;

                let artifact = await_artifact(
                    &wait_dir,
                    Some(strategy.artifact_format()),
                    strategy.download_timeout(),
                    session.cancel_token(),
                )
                .await?;

                let table = parse_artifact(
                    &artifact.path,
                    strategy.artifact_format(),
                    &strategy.parse_options(request),
                )?;
                std::fs::remove_file(&artifact.path)?;
                Ok(table)
            }
        })
        .await?;

    workdir.dispose()?;
    ensure_rows(table, request, strategy.empty_tolerant(request))
}

/// Reject customization parameters on a strategy that consumes none.
pub fn ensure_no_parameters(service: &str, request: &ReportRequest) -> Result<()> {
    if request.parameters.is_empty() {
        return Ok(());
    }
    let keys: Vec<&str> = request.parameters.keys().map(String::as_str).collect();
    Err(HarvestError::MalformedInput(format!(
        "{service} reports accept no customization parameters, got {keys:?}"
    )))
}

/// Enforce the zero-row policy on a parsed table.
pub fn ensure_rows(table: Table, request: &ReportRequest, empty_tolerant: bool) -> Result<Table> {
    if table.is_empty() && !empty_tolerant {
        return Err(HarvestError::NoData(request.report_url.clone()));
    }
    if table.is_empty() {
        warn!(report = %request.report_url, "report returned zero rows (tolerated)");
    }
    Ok(table)
}
