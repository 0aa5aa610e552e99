//! Full-page capture pipeline
//!
//! This module provides the `CaptureService` that runs the whole capture
//! sequence against one tab: attach, force lazy content to load, measure,
//! resize, clip-capture, restore and detach. The tab's viewport is the one
//! piece of shared state the pipeline mutates, and it is always put back.

use crate::{
    probe, viewport, with_debug_session, CaptureError, CaptureSettings, ClipRegion,
    DebugBackend, DebugSession, DeviceMetricsOverride, Metrics, OriginalSize, TabHandle,
    TabLocks, ViewportMetrics,
};
use base64::Engine;
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

const PAGE_HTML_JS: &str = r#"(() => {
  const dt = document.doctype;
  const doctype = dt
    ? "<!DOCTYPE " + dt.name
      + (dt.publicId ? ' PUBLIC "' + dt.publicId + '"' : "")
      + (dt.systemId ? ' "' + dt.systemId + '"' : "")
      + ">"
    : "";
  return {
    url: location.href,
    title: document.title,
    html: doctype + document.documentElement.outerHTML
  };
})()"#;

/// An encoded full-page screenshot
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub capture_id: String,
    pub tab: TabHandle,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub visible_extent: u32,
    pub target_height: u32,
    pub scroll_rounds: u32,
    pub duration: Duration,
    pub timestamp: SystemTime,
}

impl CaptureResult {
    pub fn to_data_url(&self) -> String {
        encode_png_data_url(&self.png)
    }
}

pub fn encode_png_data_url(png: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

/// Heights and widths derived from one set of measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePlan {
    pub width: u32,
    pub target_height: u32,
    pub clip_height: u32,
}

impl CapturePlan {
    pub fn compute(
        viewport: ViewportMetrics,
        visible_extent: u32,
        original: OriginalSize,
        ceiling: u32,
    ) -> Self {
        let width = if viewport.width > 0 {
            viewport.width
        } else {
            original.width
        };
        Self {
            width,
            target_height: viewport::clamp_height(original.height.max(visible_extent), ceiling),
            clip_height: viewport::clamp_height(visible_extent, ceiling),
        }
    }

    pub fn device_metrics(&self) -> DeviceMetricsOverride {
        DeviceMetricsOverride::desktop(self.width, self.target_height)
    }

    pub fn clip(&self) -> ClipRegion {
        ClipRegion::top(self.width, self.clip_height)
    }
}

/// Page HTML plus the identity of the page it came from
#[derive(Debug, Clone, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub html: String,
    #[serde(skip)]
    pub original_length: usize,
}

struct PipelineOutput {
    png: Vec<u8>,
    plan: CapturePlan,
    visible_extent: u32,
    scroll_rounds: u32,
}

/// Runs capture requests against tabs of one debugging backend
///
/// # Examples
///
/// ```rust,no_run
/// use pagecapture::{CaptureService, ChromeBackend, Config, TabHandle};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let backend = Arc::new(ChromeBackend::new(&config).await?);
///     let service = CaptureService::new(backend, config.capture.clone());
///
///     let result = service.capture_full_page(&TabHandle::new("TARGET_ID")).await?;
///     println!("Captured {}x{}", result.width, result.height);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CaptureService {
    backend: Arc<dyn DebugBackend>,
    settings: CaptureSettings,
    tab_locks: TabLocks,
}

impl CaptureService {
    pub fn new(backend: Arc<dyn DebugBackend>, settings: CaptureSettings) -> Self {
        Self {
            backend,
            settings,
            tab_locks: TabLocks::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DebugBackend> {
        &self.backend
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn tab_locks(&self) -> &TabLocks {
        &self.tab_locks
    }

    /// Capture the whole rendered page of `tab` as a PNG.
    ///
    /// The pipeline runs on its own task, so when the timeout fires the
    /// caller gets an error while viewport restoration and detach still run
    /// to completion in the background.
    pub async fn capture_full_page(&self, tab: &TabHandle) -> Result<CaptureResult, CaptureError> {
        let service = self.clone();
        let owned_tab = tab.clone();
        let task = tokio::spawn(async move { service.capture_exclusive(&owned_tab).await });

        match timeout(self.settings.capture_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(CaptureError::CaptureBackend(format!(
                "capture task failed: {join_error}"
            ))),
            Err(_) => {
                warn!("Capture of tab {} timed out, cleanup continues in background", tab);
                Err(CaptureError::Timeout(self.settings.capture_timeout))
            }
        }
    }

    async fn capture_exclusive(&self, tab: &TabHandle) -> Result<CaptureResult, CaptureError> {
        let _guard = self.tab_locks.acquire(tab).await;
        let capture_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("capture", capture_id = %capture_id, tab = %tab);

        let start_time = Instant::now();
        let settings = &self.settings;
        let outcome = with_debug_session(
            self.backend.clone(),
            tab,
            &settings.protocol_version,
            settings.detach_delay,
            |session| async move { run_pipeline(&session, settings).await },
        )
        .instrument(span.clone())
        .await;

        let decoded = outcome.and_then(|output| {
            let dimensions = png_dimensions(&output.png)?;
            Ok((output, dimensions))
        });
        let duration = start_time.elapsed();
        Metrics::global().record_capture(duration, decoded.is_ok());

        let (output, (width, height)) = decoded?;
        span.in_scope(|| {
            info!(
                "Captured {}x{} ({}) in {}",
                width,
                height,
                crate::format_bytes(output.png.len()),
                crate::format_duration(duration)
            )
        });

        Ok(CaptureResult {
            capture_id,
            tab: tab.clone(),
            png: output.png,
            width,
            height,
            visible_extent: output.visible_extent,
            target_height: output.plan.target_height,
            scroll_rounds: output.scroll_rounds,
            duration,
            timestamp: SystemTime::now(),
        })
    }

    /// Read the page's URL, title and HTML, truncated to `max_chars`.
    pub async fn page_snapshot(
        &self,
        tab: &TabHandle,
        max_chars: usize,
    ) -> Result<PageSnapshot, CaptureError> {
        let _guard = self.tab_locks.acquire(tab).await;
        let mut snapshot: PageSnapshot = with_debug_session(
            self.backend.clone(),
            tab,
            &self.settings.protocol_version,
            self.settings.detach_delay,
            |session| async move { session.evaluate_as(PAGE_HTML_JS).await },
        )
        .await?;

        snapshot.original_length = snapshot.html.chars().count();
        snapshot.html = crate::truncate_chars(&snapshot.html, max_chars);
        debug!(
            "Snapshot of {}: {} of {} chars kept",
            snapshot.url,
            snapshot.html.chars().count(),
            snapshot.original_length
        );
        Ok(snapshot)
    }
}

async fn run_pipeline(
    session: &DebugSession,
    settings: &CaptureSettings,
) -> Result<PipelineOutput, CaptureError> {
    let scroll_origin = probe::get_scroll_position(session).await?;
    let outcome = measure_and_capture(session, settings).await;

    if let Err(e) = probe::restore_scroll_position(session, scroll_origin).await {
        warn!("Could not restore scroll position on tab {}: {}", session.tab(), e);
    }
    outcome
}

async fn measure_and_capture(
    session: &DebugSession,
    settings: &CaptureSettings,
) -> Result<PipelineOutput, CaptureError> {
    let scroll = probe::pre_scroll_to_load(session, &settings.scroll).await?;
    let viewport_size = probe::get_viewport_size(session).await?;
    let visible_extent = probe::get_visible_bottom_y(session, settings.bottom_buffer_px).await?;

    let tab_dimensions = session.tab_dimensions().await.unwrap_or_else(|e| {
        warn!("Could not read tab dimensions, using measured viewport: {}", e);
        Default::default()
    });
    let original = OriginalSize::resolve(
        Some((viewport_size.width, viewport_size.height)),
        tab_dimensions,
        (settings.fallback_width, settings.fallback_height),
    );

    let plan = CapturePlan::compute(
        viewport_size,
        visible_extent,
        original,
        settings.height_ceiling,
    );
    debug!(
        "Capture plan: extent {} after {} scroll rounds, viewport {}x{}, clip height {}",
        visible_extent, scroll.rounds, plan.width, plan.target_height, plan.clip_height
    );

    let captured = resize_and_capture(session, &plan, settings).await;
    let restored = viewport::restore_device_metrics(session, original).await;

    match (captured, restored) {
        (Ok(png), Ok(())) => Ok(PipelineOutput {
            png,
            plan,
            visible_extent,
            scroll_rounds: scroll.rounds,
        }),
        (Ok(_), Err(e)) => {
            Metrics::global().record_restore_failure();
            Err(CaptureError::CaptureBackend(format!(
                "failed to restore viewport: {e}"
            )))
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore_error)) => {
            Metrics::global().record_restore_failure();
            warn!("Viewport restore after failed capture also failed: {}", restore_error);
            Err(e)
        }
    }
}

async fn resize_and_capture(
    session: &DebugSession,
    plan: &CapturePlan,
    settings: &CaptureSettings,
) -> Result<Vec<u8>, CaptureError> {
    viewport::set_device_metrics(session, &plan.device_metrics(), settings.resize_settle).await?;
    session.capture_screenshot(&plan.clip()).await
}

fn png_dimensions(png: &[u8]) -> Result<(u32, u32), CaptureError> {
    image::io::Reader::with_format(Cursor::new(png), image::ImageFormat::Png)
        .into_dimensions()
        .map_err(|e| CaptureError::CaptureBackend(format!("screenshot is not a valid PNG: {e}")))
}
