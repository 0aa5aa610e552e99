//! Injection-code state and the reconnecting control channel
//!
//! An external controller can push a piece of injection code over a
//! WebSocket. The latest value lives in [`InjectionCodeState`], which the
//! command router shares; every update is broadcast to subscribers as an
//! `injectionCodeUpdated` notification.

use crate::{CaptureError, ControlSettings, Metrics};
use anyhow::Context;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// Notification sent to subscribers whenever the injection code changes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename = "injectionCodeUpdated", rename_all = "camelCase")]
pub struct InjectionCodeUpdate {
    pub injection_code: Option<String>,
}

/// Shared holder of the most recent injection code
#[derive(Clone)]
pub struct InjectionCodeState {
    code: Arc<RwLock<Option<String>>>,
    updates: broadcast::Sender<InjectionCodeUpdate>,
}

impl InjectionCodeState {
    /// Empty state with no subscribers.
    pub fn init() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            code: Arc::new(RwLock::new(None)),
            updates,
        }
    }

    pub async fn get(&self) -> Option<String> {
        self.code.read().await.clone()
    }

    /// Store `code` and notify every subscriber. Returns how many were notified.
    pub async fn set(&self, code: Option<String>) -> usize {
        *self.code.write().await = code.clone();
        info!(
            "Injection code updated ({} chars)",
            code.as_deref().map_or(0, |c| c.chars().count())
        );
        // No subscribers is fine, the value is still stored
        self.updates
            .send(InjectionCodeUpdate {
                injection_code: code,
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InjectionCodeUpdate> {
        self.updates.subscribe()
    }
}

impl Default for InjectionCodeState {
    fn default() -> Self {
        Self::init()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action")]
enum ControlMessage {
    #[serde(rename = "setInjectionCode", rename_all = "camelCase")]
    SetInjectionCode {
        #[serde(default)]
        injection_code: Option<String>,
    },
}

/// Apply one text frame from the controller.
///
/// Returns `Ok(true)` when the injection code was updated and `Ok(false)`
/// for well-formed messages with an action this side does not handle.
pub async fn apply_control_message(
    state: &InjectionCodeState,
    text: &str,
) -> Result<bool, CaptureError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("action").and_then(|a| a.as_str()) != Some("setInjectionCode") {
        debug!("Ignoring control message: {}", text);
        return Ok(false);
    }

    let ControlMessage::SetInjectionCode { injection_code } = serde_json::from_value(value)?;
    state.set(injection_code).await;
    Ok(true)
}

/// WebSocket client that keeps reconnecting to the controller
pub struct ControlChannel {
    settings: ControlSettings,
    state: InjectionCodeState,
    status: watch::Sender<ChannelState>,
}

impl ControlChannel {
    pub fn new(settings: ControlSettings, state: InjectionCodeState) -> Self {
        let (status, _) = watch::channel(ChannelState::Disconnected);
        Self {
            settings,
            state,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<ChannelState> {
        self.status.subscribe()
    }

    fn transition(&self, next: ChannelState) {
        let previous = self.status.send_replace(next);
        if previous != next {
            info!("Control channel {} -> {}", previous, next);
        }
    }

    /// Connect, listen, and reconnect after a fixed delay until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            self.transition(ChannelState::Connecting);
            Metrics::global().record_control_reconnect();

            tokio::select! {
                result = self.connect_and_listen() => {
                    if let Err(e) = result {
                        warn!("Control channel to {} failed: {:#}", self.settings.url, e);
                    }
                }
                _ = shutdown.recv() => {
                    self.transition(ChannelState::Disconnected);
                    return;
                }
            }

            self.transition(ChannelState::Disconnected);
            debug!(
                "Reconnecting control channel in {}",
                crate::format_duration(self.settings.reconnect_delay)
            );

            tokio::select! {
                _ = sleep(self.settings.reconnect_delay) => {}
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn connect_and_listen(&self) -> anyhow::Result<()> {
        let (mut socket, _) = tokio_tungstenite::connect_async(self.settings.url.as_str())
            .await
            .with_context(|| format!("connecting to {}", self.settings.url))?;
        self.transition(ChannelState::Connected);

        while let Some(frame) = socket.next().await {
            match frame.context("reading control frame")? {
                Message::Text(text) => {
                    if let Err(e) = apply_control_message(&self.state, &text).await {
                        warn!("Error parsing control message: {}", e);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        info!("Control channel closed by peer");
        Ok(())
    }
}
