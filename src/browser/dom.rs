//! DOM interaction helpers over a `chromiumoxide` page.
//!
//! Two lookup flavors, deliberately distinct:
//! * [`try_find`] — "is this optional element present?" Returns an `Option`,
//!   never an error. Used for feature-probing (old vs new interface, overlay
//!   present or not).
//! * [`wait_for_element`] — "this element must render." Polls with
//!   exponential backoff and surfaces `Timeout { what: Element }` when the
//!   budget runs out.

use std::time::{Duration, Instant};

use chromiumoxide::element::Element;
use chromiumoxide::Page;
use tokio_util::sync::CancellationToken;

use crate::core::error::{HarvestError, Result, WaitTarget};

const INITIAL_POLL: Duration = Duration::from_millis(100);
const MAX_POLL: Duration = Duration::from_secs(1);

/// Optional-element lookup. Absence is a normal answer, not an error.
pub async fn try_find(page: &Page, selector: &str) -> Option<Element> {
    page.find_element(selector).await.ok()
}

/// Poll for an element with exponential backoff (100 ms doubling to 1 s)
/// until it appears or `timeout` elapses.
pub async fn wait_for_element(
    page: &Page,
    selector: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Element> {
    let start = Instant::now();
    let mut poll = INITIAL_POLL;
    loop {
        if cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }
        if let Ok(element) = page.find_element(selector).await {
            return Ok(element);
        }
        if start.elapsed() >= timeout {
            return Err(HarvestError::Timeout {
                what: WaitTarget::Element,
                waited: start.elapsed(),
            });
        }
        tokio::time::sleep(poll).await;
        poll = (poll * 2).min(MAX_POLL);
    }
}

/// Clear a form field and type `value` into it.
pub async fn fill_field(
    page: &Page,
    selector: &str,
    value: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let element = wait_for_element(page, selector, timeout, cancel).await?;
    element.click().await.map_err(HarvestError::transient)?;
    // Portals pre-fill remembered usernames; clear before typing.
    element
        .call_js_fn("function() { this.value = ''; }", false)
        .await
        .map_err(HarvestError::transient)?;
    element
        .type_str(value)
        .await
        .map_err(HarvestError::transient)?;
    Ok(())
}

/// Wait for an element, then click it.
pub async fn click(
    page: &Page,
    selector: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let element = wait_for_element(page, selector, timeout, cancel).await?;
    element.click().await.map_err(HarvestError::transient)?;
    Ok(())
}

/// Press Enter on an already-located element (form submission).
pub async fn press_enter(element: &Element) -> Result<()> {
    element
        .press_key("Enter")
        .await
        .map_err(HarvestError::transient)?;
    Ok(())
}

/// Visible text of an element; empty string when the node has none.
pub async fn element_text(element: &Element) -> Result<String> {
    Ok(element
        .inner_text()
        .await
        .map_err(HarvestError::transient)?
        .unwrap_or_default()
        .trim()
        .to_string())
}

pub async fn page_title(page: &Page) -> Result<String> {
    Ok(page
        .get_title()
        .await
        .map_err(HarvestError::browser)?
        .unwrap_or_default())
}

/// Whether the browser currently holds a cookie with this name.
pub async fn has_cookie(page: &Page, name: &str) -> Result<bool> {
    let cookies = page.get_cookies().await.map_err(HarvestError::browser)?;
    Ok(cookies.iter().any(|c| c.name == name))
}

/// Collapse the session's cookies into a `Cookie:` header value, for
/// replaying the authenticated browser session over plain HTTP.
pub async fn cookie_header(page: &Page) -> Result<String> {
    let cookies = page.get_cookies().await.map_err(HarvestError::browser)?;
    Ok(cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; "))
}

/// Evaluate a JS expression and deserialize its result.
pub async fn eval_json(page: &Page, js: impl Into<String>) -> Result<serde_json::Value> {
    let outcome = page
        .evaluate(js.into())
        .await
        .map_err(|e| HarvestError::Browser(format!("evaluate failed: {e}")))?;
    outcome
        .into_value::<serde_json::Value>()
        .map_err(|e| HarvestError::Browser(format!("evaluate result: {e}")))
}

pub async fn eval_bool(page: &Page, js: impl Into<String>) -> Result<bool> {
    Ok(eval_json(page, js).await?.as_bool().unwrap_or(false))
}

pub async fn eval_u64(page: &Page, js: impl Into<String>) -> Result<u64> {
    Ok(eval_json(page, js).await?.as_u64().unwrap_or(0))
}

pub async fn eval_string(page: &Page, js: impl Into<String>) -> Result<String> {
    Ok(eval_json(page, js)
        .await?
        .as_str()
        .unwrap_or_default()
        .to_string())
}

/// Select an `<option>` by value on a `<select>` and fire its change event.
/// Returns `false` when the select or the option is absent.
pub async fn select_by_value(page: &Page, selector: &str, value: &str) -> Result<bool> {
    let js = format!(
        "(() => {{ \
           const sel = document.querySelector({sel}); \
           if (!sel) return false; \
           const opt = Array.from(sel.options).find(o => o.value === {val}); \
           if (!opt) return false; \
           sel.value = opt.value; \
           sel.dispatchEvent(new Event('change', {{ bubbles: true }})); \
           return true; \
         }})()",
        sel = js_string(selector),
        val = js_string(value),
    );
    eval_bool(page, js).await
}

/// Click the first element matching `selector` whose text contains `label`.
/// Returns `false` when none matches.
pub async fn click_by_text(page: &Page, selector: &str, label: &str) -> Result<bool> {
    let js = format!(
        "(() => {{ \
           const el = Array.from(document.querySelectorAll({sel})) \
             .find(e => (e.textContent || '').includes({label})); \
           if (!el) return false; \
           el.click(); \
           return true; \
         }})()",
        sel = js_string(selector),
        label = js_string(label),
    );
    eval_bool(page, js).await
}

/// Remove every element matching `selector` from the live DOM. Returns the
/// number removed. Used against third-party overlays that cover buttons.
pub async fn remove_elements(page: &Page, selector: &str) -> Result<u64> {
    let js = format!(
        "(() => {{ \
           const els = Array.from(document.querySelectorAll({sel})); \
           els.forEach(e => e.parentNode && e.parentNode.removeChild(e)); \
           return els.length; \
         }})()",
        sel = js_string(selector),
    );
    eval_u64(page, js).await
}

/// Quote a Rust string as a JS string literal. JSON string syntax is valid
/// JS, so this also escapes quotes and backslashes in selector text.
pub fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_string_escapes_quotes_and_backslashes() {
        assert_eq!(js_string("plain"), "\"plain\"");
        assert_eq!(js_string(r#"a"b"#), r#""a\"b""#);
        assert_eq!(js_string(r"a\b"), r#""a\\b""#);
    }

    #[test]
    fn js_string_embeds_cleanly_in_snippets() {
        let snippet = format!("document.querySelector({})", js_string("tr[data-id=\"x\"]"));
        assert!(snippet.contains(r#"\"x\""#));
    }
}
