//! Debug session management
//!
//! A [`DebugSession`] is an exclusive debugging attachment to one tab. All
//! page probes, viewport overrides and screenshots go through a session, and
//! sessions only exist inside [`with_debug_session`], which pairs every
//! successful attach with exactly one detach.

use crate::{CaptureError, ClipRegion, DeviceMetricsOverride};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Identifier of a browser tab (a page target id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabHandle(pub String);

impl TabHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tab as listed by the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabInfo {
    pub handle: TabHandle,
    pub url: String,
    pub title: String,
}

/// Steady-state size of a tab's content area, before any override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TabDimensions {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Low-level debugging operations against browser tabs
///
/// Implementations must refuse a second `attach` for a tab that is already
/// attached, so at most one live session exists per tab.
#[async_trait]
pub trait DebugBackend: Send + Sync {
    async fn attach(&self, tab: &TabHandle, protocol_version: &str) -> Result<(), CaptureError>;

    async fn detach(&self, tab: &TabHandle) -> Result<(), CaptureError>;

    /// Evaluate an expression in the page with return-by-value semantics.
    /// `None` means the expression produced no serializable value.
    async fn evaluate(
        &self,
        tab: &TabHandle,
        expression: &str,
    ) -> Result<Option<serde_json::Value>, CaptureError>;

    async fn set_device_metrics(
        &self,
        tab: &TabHandle,
        metrics: &DeviceMetricsOverride,
    ) -> Result<(), CaptureError>;

    /// Drop any device metrics override so the tab follows its window again.
    async fn clear_device_metrics(&self, tab: &TabHandle) -> Result<(), CaptureError>;

    /// Capture a lossless PNG of `clip`, rendered from the composited surface.
    async fn capture_screenshot(
        &self,
        tab: &TabHandle,
        clip: &ClipRegion,
    ) -> Result<Vec<u8>, CaptureError>;

    async fn tab_dimensions(&self, tab: &TabHandle) -> Result<TabDimensions, CaptureError>;

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, CaptureError>;

    /// The tab a requester without an explicit tab id is acting from.
    async fn active_tab(&self) -> Result<Option<TabHandle>, CaptureError>;
}

/// An open debugging attachment to one tab
#[derive(Clone)]
pub struct DebugSession {
    backend: Arc<dyn DebugBackend>,
    tab: TabHandle,
}

impl DebugSession {
    pub fn tab(&self) -> &TabHandle {
        &self.tab
    }

    pub async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, CaptureError> {
        self.backend
            .evaluate(&self.tab, expression)
            .await?
            .ok_or_else(|| CaptureError::Probe("evaluation returned no value".to_string()))
    }

    pub async fn evaluate_as<T: DeserializeOwned>(
        &self,
        expression: &str,
    ) -> Result<T, CaptureError> {
        let value = self.evaluate(expression).await?;
        serde_json::from_value(value)
            .map_err(|e| CaptureError::Probe(format!("unexpected result shape: {e}")))
    }

    /// Evaluate for side effects only; a missing value is not an error.
    pub async fn run(&self, expression: &str) -> Result<Option<serde_json::Value>, CaptureError> {
        self.backend.evaluate(&self.tab, expression).await
    }

    pub async fn set_device_metrics(
        &self,
        metrics: &DeviceMetricsOverride,
    ) -> Result<(), CaptureError> {
        self.backend.set_device_metrics(&self.tab, metrics).await
    }

    pub async fn clear_device_metrics(&self) -> Result<(), CaptureError> {
        self.backend.clear_device_metrics(&self.tab).await
    }

    pub async fn capture_screenshot(&self, clip: &ClipRegion) -> Result<Vec<u8>, CaptureError> {
        self.backend.capture_screenshot(&self.tab, clip).await
    }

    pub async fn tab_dimensions(&self) -> Result<TabDimensions, CaptureError> {
        self.backend.tab_dimensions(&self.tab).await
    }
}

/// Attach to `tab`, run `body`, then detach.
///
/// Cleanup contract:
/// - if attaching fails the error is returned and no detach is attempted;
/// - otherwise the session is detached after `detach_delay`, whether `body`
///   succeeded, failed or panicked (the panic resumes after detaching);
/// - a failing detach never replaces the outcome of `body`. It is logged and
///   dropped (cleanup may fail silently).
pub async fn with_debug_session<T, F, Fut>(
    backend: Arc<dyn DebugBackend>,
    tab: &TabHandle,
    protocol_version: &str,
    detach_delay: Duration,
    body: F,
) -> Result<T, CaptureError>
where
    F: FnOnce(DebugSession) -> Fut,
    Fut: Future<Output = Result<T, CaptureError>>,
{
    backend
        .attach(tab, protocol_version)
        .await
        .map_err(|e| match e {
            CaptureError::Attach(_) => e,
            other => CaptureError::Attach(other.to_string()),
        })?;
    debug!("Attached debugger to tab {} (protocol {})", tab, protocol_version);

    let session = DebugSession {
        backend: backend.clone(),
        tab: tab.clone(),
    };
    let result = AssertUnwindSafe(body(session)).catch_unwind().await;

    sleep(detach_delay).await;
    match backend.detach(tab).await {
        Ok(()) => debug!("Detached debugger from tab {}", tab),
        Err(e) => {
            warn!("Ignoring detach failure for tab {}: {}", tab, e);
            crate::Metrics::global().record_detach_failure();
        }
    }

    match result {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Per-tab locks serializing concurrent requests against the same tab
///
/// An entry lives only while some request holds or waits on it.
#[derive(Clone, Default)]
pub struct TabLocks {
    locks: Arc<DashMap<TabHandle, Arc<Mutex<()>>>>,
}

/// Exclusive hold on one tab; releasing the last hold drops the entry
pub struct TabGuard {
    guard: Option<OwnedMutexGuard<()>>,
    tab: TabHandle,
    locks: Arc<DashMap<TabHandle, Arc<Mutex<()>>>>,
}

impl Drop for TabGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.tab, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl TabLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, tab: &TabHandle) -> TabGuard {
        let lock = self
            .locks
            .entry(tab.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        TabGuard {
            guard: Some(lock.lock_owned().await),
            tab: tab.clone(),
            locks: self.locks.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
