//! Device metrics overrides for capturing beyond the visible viewport

use crate::{CaptureError, DebugSession, TabDimensions};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenOrientation {
    PortraitPrimary,
}

/// A temporary substitute for a tab's rendering viewport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetricsOverride {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub screen_orientation: ScreenOrientation,
    pub mobile: bool,
}

impl DeviceMetricsOverride {
    /// Desktop metrics at a 1:1 pixel ratio in portrait-primary orientation.
    pub fn desktop(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            device_scale_factor: 1.0,
            screen_orientation: ScreenOrientation::PortraitPrimary,
            mobile: false,
        }
    }
}

/// Page region handed to the screenshot command, in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

impl ClipRegion {
    pub fn top(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f64,
            height: height as f64,
            scale: 1.0,
        }
    }
}

/// Concrete dimensions to restore once a capture is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalSize {
    pub width: u32,
    pub height: u32,
}

impl OriginalSize {
    /// The viewport measured before any override first, then the tab's
    /// layout viewport, then the fallback.
    ///
    /// The measured viewport includes the scrollbar gutter like the capture
    /// override does; the layout viewport does not.
    pub fn resolve(
        viewport: Option<(u32, u32)>,
        tab: TabDimensions,
        fallback: (u32, u32),
    ) -> Self {
        let pick = |measured: Option<u32>, tab: Option<u32>, fallback: u32| {
            measured
                .filter(|v| *v > 0)
                .or(tab.filter(|v| *v > 0))
                .unwrap_or(fallback)
        };
        Self {
            width: pick(viewport.map(|v| v.0), tab.width, fallback.0),
            height: pick(viewport.map(|v| v.1), tab.height, fallback.1),
        }
    }
}

pub fn clamp_height(height: u32, ceiling: u32) -> u32 {
    height.min(ceiling)
}

/// Apply `metrics` and wait `settle` for responsive layout to re-flow.
pub async fn set_device_metrics(
    session: &DebugSession,
    metrics: &DeviceMetricsOverride,
    settle: Duration,
) -> Result<(), CaptureError> {
    debug!(
        "Overriding device metrics on tab {} to {}x{}",
        session.tab(),
        metrics.width,
        metrics.height
    );
    session.set_device_metrics(metrics).await?;
    sleep(settle).await;
    Ok(())
}

/// Reapply `original`, then hand the tab back without any override.
///
/// Only a failed reapply is returned. Clearing is best-effort: a tab left
/// pinned at its original size is logged and counted.
pub async fn restore_device_metrics(
    session: &DebugSession,
    original: OriginalSize,
) -> Result<(), CaptureError> {
    debug!(
        "Restoring device metrics on tab {} to {}x{}",
        session.tab(),
        original.width,
        original.height
    );
    let reapplied = session
        .set_device_metrics(&DeviceMetricsOverride::desktop(original.width, original.height))
        .await;

    if let Err(e) = session.clear_device_metrics().await {
        warn!(
            "Could not clear device metrics override on tab {}: {}",
            session.tab(),
            e
        );
        crate::Metrics::global().record_restore_failure();
    }

    reapplied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_height() {
        assert_eq!(clamp_height(60_000, 45_000), 45_000);
        assert_eq!(clamp_height(4_808, 45_000), 4_808);
        assert_eq!(clamp_height(45_000, 45_000), 45_000);
    }

    #[test]
    fn test_original_size_fallback_chain() {
        // Layout viewport reports 15px less: the scrollbar gutter
        let tab = TabDimensions {
            width: Some(1265),
            height: Some(800),
        };
        assert_eq!(
            OriginalSize::resolve(Some((1280, 800)), tab, (1280, 720)),
            OriginalSize { width: 1280, height: 800 }
        );
        assert_eq!(
            OriginalSize::resolve(Some((0, 0)), tab, (1280, 720)),
            OriginalSize { width: 1265, height: 800 }
        );

        let missing = TabDimensions::default();
        assert_eq!(
            OriginalSize::resolve(Some((1024, 700)), missing, (1280, 720)),
            OriginalSize { width: 1024, height: 700 }
        );
        assert_eq!(
            OriginalSize::resolve(None, missing, (1280, 720)),
            OriginalSize { width: 1280, height: 720 }
        );

        let zero = TabDimensions {
            width: Some(0),
            height: None,
        };
        assert_eq!(
            OriginalSize::resolve(Some((0, 0)), zero, (1280, 720)),
            OriginalSize { width: 1280, height: 720 }
        );
    }

    #[test]
    fn test_desktop_override() {
        let metrics = DeviceMetricsOverride::desktop(1280, 4808);
        assert_eq!(metrics.device_scale_factor, 1.0);
        assert_eq!(metrics.screen_orientation, ScreenOrientation::PortraitPrimary);
        assert!(!metrics.mobile);
    }
}
