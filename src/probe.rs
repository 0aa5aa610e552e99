//! Read-only page probes evaluated inside the page's JavaScript context
//!
//! Every probe is a self-contained expression evaluated with return-by-value
//! semantics, so results are plain JSON values rather than object handles.

use crate::{CaptureError, DebugSession, ScrollSettings};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::debug;

const VIEWPORT_SIZE_JS: &str = r#"(() => ({
  width: Math.max(window.innerWidth, document.documentElement.clientWidth),
  height: Math.max(window.innerHeight, document.documentElement.clientHeight)
}))()"#;

const SCROLL_TO_BOTTOM_JS: &str =
    "window.scrollTo(0, document.body.scrollHeight); document.body.scrollHeight;";

const SCROLL_HEIGHT_JS: &str = "document.body.scrollHeight";

const SCROLL_TO_TOP_JS: &str = "window.scrollTo(0, 0); true;";

const SCROLL_POSITION_JS: &str = "({ x: window.scrollX, y: window.scrollY })";

/// Size of the rendering viewport as the page sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportMetrics {
    pub width: u32,
    pub height: u32,
}

/// Document scroll offset in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub x: f64,
    pub y: f64,
}

/// Outcome of the lazy-load scroll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollReport {
    pub rounds: u32,
    pub final_height: u32,
    pub stabilized: bool,
}

fn visible_bottom_js(buffer_px: u32) -> String {
    format!(
        r#"(() => {{
  const els = document.body ? document.body.querySelectorAll("*") : [];
  let max = 0;
  for (const el of els) {{
    const r = el.getBoundingClientRect();
    if (r.width <= 0 || r.height <= 0) continue;
    const style = window.getComputedStyle(el);
    if (style.display === "none") continue;
    if (style.visibility === "hidden" || style.visibility === "collapse") continue;
    if (parseFloat(style.opacity) === 0) continue;
    if (r.bottom > max) max = r.bottom;
  }}
  return Math.max(1, Math.ceil(max + window.scrollY + {buffer_px}));
}})()"#
    )
}

pub async fn get_viewport_size(session: &DebugSession) -> Result<ViewportMetrics, CaptureError> {
    let metrics: ViewportMetrics = session.evaluate_as(VIEWPORT_SIZE_JS).await?;
    debug!("Viewport size {}x{}", metrics.width, metrics.height);
    Ok(metrics)
}

pub async fn get_scroll_position(session: &DebugSession) -> Result<ScrollPosition, CaptureError> {
    session.evaluate_as(SCROLL_POSITION_JS).await
}

pub async fn restore_scroll_position(
    session: &DebugSession,
    position: ScrollPosition,
) -> Result<(), CaptureError> {
    debug!("Scrolling tab {} back to {},{}", session.tab(), position.x, position.y);
    session
        .run(&format!("window.scrollTo({}, {}); true;", position.x, position.y))
        .await?;
    Ok(())
}

/// Lowest document-coordinate point of any visible element, plus `buffer_px`.
pub async fn get_visible_bottom_y(
    session: &DebugSession,
    buffer_px: u32,
) -> Result<u32, CaptureError> {
    let value = session.evaluate(&visible_bottom_js(buffer_px)).await?;
    let bottom = as_pixels(&value)
        .ok_or_else(|| CaptureError::Probe(format!("visible extent is not a number: {value}")))?;
    debug!("Visible bottom at {}px", bottom);
    Ok(bottom.max(1))
}

/// Scroll to the bottom repeatedly until the document height settles.
///
/// Runs at most `max_rounds` rounds and always ends scrolled back to the top,
/// including when a round fails.
pub async fn pre_scroll_to_load(
    session: &DebugSession,
    settings: &ScrollSettings,
) -> Result<ScrollReport, CaptureError> {
    let report = match scroll_rounds(session, settings).await {
        Ok(report) => report,
        Err(e) => {
            if let Err(top_error) = session.run(SCROLL_TO_TOP_JS).await {
                debug!("Could not scroll back to top after failed round: {}", top_error);
            }
            return Err(e);
        }
    };

    session.run(SCROLL_TO_TOP_JS).await?;
    sleep(settings.top_settle).await;
    Ok(report)
}

async fn scroll_rounds(
    session: &DebugSession,
    settings: &ScrollSettings,
) -> Result<ScrollReport, CaptureError> {
    let mut last = 0u32;
    let mut rounds = 0u32;
    let mut stabilized = false;

    while rounds < settings.max_rounds {
        rounds += 1;
        session.run(SCROLL_TO_BOTTOM_JS).await?;
        sleep(settings.round_settle).await;

        let height = session.run(SCROLL_HEIGHT_JS).await?.as_ref().and_then(as_pixels);
        debug!("Scroll round {}: height {:?} (previous {})", rounds, height, last);

        if is_stable(last, height, settings.stable_threshold_px) {
            stabilized = true;
            break;
        }
        if let Some(h) = height.filter(|h| *h > 0) {
            last = h;
        }
    }

    Ok(ScrollReport {
        rounds,
        final_height: last,
        stabilized,
    })
}

/// A reported height within `threshold` of the previous one counts as settled.
pub fn is_stable(last: u32, height: Option<u32>, threshold: u32) -> bool {
    match height {
        Some(h) if h > 0 => h.abs_diff(last) < threshold,
        _ => false,
    }
}

fn as_pixels(value: &serde_json::Value) -> Option<u32> {
    let number = value.as_f64()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some(number.ceil().min(u32::MAX as f64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_stable() {
        assert!(is_stable(5000, Some(5000), 40));
        assert!(is_stable(5000, Some(5039), 40));
        assert!(!is_stable(5000, Some(5040), 40));
        assert!(!is_stable(0, Some(0), 40));
        assert!(!is_stable(100, None, 40));
        assert!(is_stable(0, Some(10), 40));
    }

    #[test]
    fn test_as_pixels() {
        assert_eq!(as_pixels(&json!(4808)), Some(4808));
        assert_eq!(as_pixels(&json!(4807.2)), Some(4808));
        assert_eq!(as_pixels(&json!(-3)), None);
        assert_eq!(as_pixels(&json!("12")), None);
        assert_eq!(as_pixels(&json!(null)), None);
    }

    #[test]
    fn test_visible_bottom_expression_embeds_buffer() {
        let js = visible_bottom_js(8);
        assert!(js.contains("window.scrollY + 8"));
        assert!(js.contains("getComputedStyle"));
        assert!(js.contains("Math.max(1,"));
    }
}
