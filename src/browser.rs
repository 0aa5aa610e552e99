//! Chrome DevTools Protocol backend
//!
//! Connects to a running Chromium-family browser through its remote
//! debugging endpoint (or launches one) and implements [`DebugBackend`] on
//! top of chromiumoxide pages.

use crate::{
    create_browser_config, CaptureError, ClipRegion, Config, DebugBackend,
    DeviceMetricsOverride, ScreenOrientation, TabDimensions, TabHandle, TabInfo,
};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::{
    ClearDeviceMetricsOverrideParams, ScreenOrientation as CdpScreenOrientation,
    ScreenOrientationType, SetDeviceMetricsOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams, GetLayoutMetricsParams,
    Viewport as CdpViewport,
};
use chromiumoxide::cdp::browser_protocol::target::TargetId;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Deserialize)]
struct JsonVersion {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Debugging backend driving a real browser
pub struct ChromeBackend {
    browser: Mutex<Browser>,
    handler: JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    sessions: DashMap<TabHandle, Page>,
    launched: bool,
}

impl ChromeBackend {
    /// Connect or launch according to `config.browser`.
    ///
    /// Failing to reach the browser is a configuration error: without a
    /// debugging endpoint no capture can ever succeed.
    pub async fn new(config: &Config) -> Result<Self, CaptureError> {
        let settings = &config.browser;
        let connect_timeout = settings.connect_timeout;

        let (mut browser, mut handler, launched) = match &settings.debugging_url {
            Some(url) => {
                let ws_url = if url.starts_with("ws://") || url.starts_with("wss://") {
                    url.clone()
                } else {
                    discover_ws_endpoint(url, connect_timeout).await?
                };
                info!("Connecting to browser at {}", ws_url);
                let (browser, handler) = timeout(connect_timeout, Browser::connect(ws_url))
                    .await
                    .map_err(|_| {
                        CaptureError::Configuration("timed out connecting to browser".to_string())
                    })?
                    .map_err(|e| CaptureError::Configuration(e.to_string()))?;
                (browser, handler, false)
            }
            None => {
                info!("Launching browser");
                let (browser, handler) = Browser::launch(create_browser_config(config)?)
                    .await
                    .map_err(|e| CaptureError::Configuration(e.to_string()))?;
                (browser, handler, true)
            }
        };

        // The handler implements Stream and must be polled for any command to complete
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("Handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        tracing::info!("Handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        if !launched {
            // Make tabs that were open before we connected visible as pages
            if let Err(e) = browser.fetch_targets().await {
                warn!("Could not fetch existing targets: {}", e);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(Self {
            browser: Mutex::new(browser),
            handler: handler_task,
            sessions: DashMap::new(),
            launched,
        })
    }

    /// Open a new tab at `url` and wait for it to finish loading.
    pub async fn open_tab(&self, url: &str) -> Result<TabHandle, CaptureError> {
        let page = self
            .browser
            .lock()
            .await
            .new_page(url)
            .await
            .map_err(|e| CaptureError::CaptureBackend(format!("failed to open {url}: {e}")))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| CaptureError::CaptureBackend(format!("failed to load {url}: {e}")))?;
        Ok(TabHandle::new(page.target_id().inner().clone()))
    }

    pub async fn shutdown(&self) {
        self.sessions.clear();
        if self.launched {
            info!("Closing launched browser");
            let _ = self.browser.lock().await.close().await;
        }
        self.handler.abort();
    }

    fn page(&self, tab: &TabHandle) -> Result<Page, CaptureError> {
        self.sessions
            .get(tab)
            .map(|page| page.clone())
            .ok_or_else(|| CaptureError::CaptureBackend(format!("tab {tab} is not attached")))
    }
}

#[async_trait]
impl DebugBackend for ChromeBackend {
    async fn attach(&self, tab: &TabHandle, protocol_version: &str) -> Result<(), CaptureError> {
        let (page, available) = {
            let browser = self.browser.lock().await;
            let version = browser
                .version()
                .await
                .map_err(|e| CaptureError::Attach(e.to_string()))?;
            let page = browser
                .get_page(TargetId::new(tab.as_str()))
                .await
                .map_err(|e| CaptureError::Attach(format!("no tab {tab}: {e}")))?;
            (page, version.protocol_version)
        };

        if !protocol_supported(protocol_version, &available) {
            return Err(CaptureError::Attach(format!(
                "browser speaks protocol {available}, {protocol_version} requested"
            )));
        }

        match self.sessions.entry(tab.clone()) {
            Entry::Occupied(_) => Err(CaptureError::Attach(format!(
                "another debugger is already attached to tab {tab}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(page);
                Ok(())
            }
        }
    }

    async fn detach(&self, tab: &TabHandle) -> Result<(), CaptureError> {
        self.sessions
            .remove(tab)
            .map(|_| ())
            .ok_or_else(|| CaptureError::Detach(format!("tab {tab} is not attached")))
    }

    async fn evaluate(
        &self,
        tab: &TabHandle,
        expression: &str,
    ) -> Result<Option<serde_json::Value>, CaptureError> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(CaptureError::Probe)?;

        let response = self
            .page(tab)?
            .execute(params)
            .await
            .map_err(|e| CaptureError::Probe(e.to_string()))?;

        if let Some(details) = &response.result.exception_details {
            return Err(CaptureError::Probe(format!(
                "page script threw: {}",
                details.text
            )));
        }
        Ok(response.result.result.value.clone())
    }

    async fn set_device_metrics(
        &self,
        tab: &TabHandle,
        metrics: &DeviceMetricsOverride,
    ) -> Result<(), CaptureError> {
        let orientation = match metrics.screen_orientation {
            ScreenOrientation::PortraitPrimary => {
                CdpScreenOrientation::new(ScreenOrientationType::PortraitPrimary, 0)
            }
        };
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(metrics.width as i64)
            .height(metrics.height as i64)
            .device_scale_factor(metrics.device_scale_factor)
            .mobile(metrics.mobile)
            .screen_orientation(orientation)
            .build()
            .map_err(CaptureError::CaptureBackend)?;

        self.page(tab)?.execute(params).await?;
        Ok(())
    }

    async fn clear_device_metrics(&self, tab: &TabHandle) -> Result<(), CaptureError> {
        self.page(tab)?
            .execute(ClearDeviceMetricsOverrideParams::default())
            .await?;
        Ok(())
    }

    async fn capture_screenshot(
        &self,
        tab: &TabHandle,
        clip: &ClipRegion,
    ) -> Result<Vec<u8>, CaptureError> {
        let params = CaptureScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .from_surface(true)
            .clip(CdpViewport {
                x: clip.x,
                y: clip.y,
                width: clip.width,
                height: clip.height,
                scale: clip.scale,
            })
            .build();

        let response = self.page(tab)?.execute(params).await?;
        base64::engine::general_purpose::STANDARD
            .decode(&response.result.data)
            .map_err(|e| CaptureError::CaptureBackend(format!("invalid screenshot data: {e}")))
    }

    /// Layout viewport size, which leaves out any classic scrollbar gutter.
    async fn tab_dimensions(&self, tab: &TabHandle) -> Result<TabDimensions, CaptureError> {
        let response = self
            .page(tab)?
            .execute(GetLayoutMetricsParams::default())
            .await?;
        let layout = &response.result.css_layout_viewport;
        Ok(TabDimensions {
            width: u32::try_from(layout.client_width).ok(),
            height: u32::try_from(layout.client_height).ok(),
        })
    }

    async fn list_tabs(&self) -> Result<Vec<TabInfo>, CaptureError> {
        let pages = self.browser.lock().await.pages().await?;
        let mut tabs = Vec::with_capacity(pages.len());
        for page in pages {
            tabs.push(TabInfo {
                handle: TabHandle::new(page.target_id().inner().clone()),
                url: page.url().await.ok().flatten().unwrap_or_default(),
                title: page.get_title().await.ok().flatten().unwrap_or_default(),
            });
        }
        Ok(tabs)
    }

    async fn active_tab(&self) -> Result<Option<TabHandle>, CaptureError> {
        let pages = self.browser.lock().await.pages().await?;
        let mut first = None;
        for page in pages {
            let handle = TabHandle::new(page.target_id().inner().clone());
            let visible = match page.evaluate("document.visibilityState").await {
                Ok(result) => result.into_value::<String>().ok().as_deref() == Some("visible"),
                Err(_) => false,
            };
            if visible {
                debug!("Active tab resolved to {}", handle);
                return Ok(Some(handle));
            }
            first.get_or_insert(handle);
        }
        Ok(first)
    }
}

/// Resolve a browser-level WebSocket URL from an HTTP debugging endpoint.
pub async fn discover_ws_endpoint(
    http_url: &str,
    connect_timeout: Duration,
) -> Result<String, CaptureError> {
    let url = format!("{}/json/version", http_url.trim_end_matches('/'));
    debug!("Requesting browser version info from {}", url);

    let client = reqwest::Client::builder()
        .timeout(connect_timeout)
        .build()
        .map_err(|e| CaptureError::Configuration(format!("failed to build HTTP client: {e}")))?;
    let response = client.get(&url).send().await.map_err(|e| {
        CaptureError::Configuration(format!("debugging endpoint unreachable at {url}: {e}"))
    })?;
    if !response.status().is_success() {
        return Err(CaptureError::Configuration(format!(
            "{url} returned {}",
            response.status()
        )));
    }

    let body: JsonVersion = response.json().await.map_err(|e| {
        CaptureError::Configuration(format!("unexpected /json/version response: {e}"))
    })?;
    Ok(body.web_socket_debugger_url)
}

/// Whether a browser speaking `available` accepts a client asking for
/// `requested`: same major version, browser minor at least the requested one.
pub fn protocol_supported(requested: &str, available: &str) -> bool {
    fn parse(version: &str) -> Option<(u32, u32)> {
        let (major, minor) = version.trim().split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    }

    match (parse(requested), parse(available)) {
        (Some((req_major, req_minor)), Some((av_major, av_minor))) => {
            req_major == av_major && av_minor >= req_minor
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_supported() {
        assert!(protocol_supported("1.3", "1.3"));
        assert!(protocol_supported("1.2", "1.3"));
        assert!(!protocol_supported("1.4", "1.3"));
        assert!(!protocol_supported("2.0", "1.3"));
        assert!(!protocol_supported("1", "1.3"));
        assert!(!protocol_supported("1.3", "garbage"));
    }

    #[test]
    fn test_json_version_parsing() {
        let body = r#"{
            "Browser": "Chrome/120.0.0.0",
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc"
        }"#;
        let parsed: JsonVersion = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.web_socket_debugger_url,
            "ws://127.0.0.1:9222/devtools/browser/abc"
        );
    }
}
