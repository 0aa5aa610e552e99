//! Request dispatch
//!
//! The router turns action-tagged JSON requests into capture, readiness and
//! injection-code operations and always answers with exactly one response.
//! Failures never escape as errors: they become `{ok: false, error}`.

use crate::{CaptureError, CaptureService, ErrorSeverity, InjectionCodeState, TabHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An incoming request, tagged by its `action` field
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    CaptureFullPage {
        #[serde(default, deserialize_with = "tab_id_from_json")]
        tab_id: Option<TabHandle>,
        #[serde(default)]
        download: bool,
        #[serde(default)]
        filename: Option<String>,
    },
    Ping,
    GetInjectionCode,
    #[serde(rename_all = "camelCase")]
    SetInjectionCode {
        #[serde(default)]
        injection_code: Option<String>,
    },
}

// Tab ids arrive as strings (target ids) or as plain numbers
fn tab_id_from_json<'de, D>(deserializer: D) -> Result<Option<TabHandle>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(id)) if id.is_empty() => Ok(None),
        Some(serde_json::Value::String(id)) => Ok(Some(TabHandle::new(id))),
        Some(serde_json::Value::Number(n)) => Ok(Some(TabHandle::new(n.to_string()))),
        Some(other) => Err(D::Error::custom(format!("invalid tabId: {other}"))),
    }
}

/// The single answer to a [`Request`]
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    DataUrl(String),
    Saved { filename: String },
    Ready,
    Failure(String),
    InjectionCode(Option<String>),
    InjectionCodeSet,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        !matches!(self, Response::Failure(_))
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Response::DataUrl(data_url) => json!({ "ok": true, "dataUrl": data_url }),
            Response::Saved { filename } => json!({ "ok": true, "filename": filename }),
            Response::Ready => json!({ "ok": true }),
            Response::Failure(error) => json!({ "ok": false, "error": error }),
            Response::InjectionCode(code) => {
                json!({ "success": true, "injectionCode": code })
            }
            Response::InjectionCodeSet => json!({ "success": true }),
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Where persisted screenshots go
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Persist `bytes` under `filename` and return where they were written.
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, CaptureError>;
}

/// Writes files below a fixed directory
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileSink for DirectorySink {
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, CaptureError> {
        let path = self.root.join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!("Wrote {} to {}", crate::format_bytes(bytes.len()), path.display());
        Ok(path)
    }
}

/// Sanitized requested name, or `fullpage_<unix-millis>.png`.
pub fn resolve_filename(requested: Option<&str>, now: DateTime<Utc>) -> String {
    requested
        .map(crate::sanitize_filename)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("fullpage_{}.png", now.timestamp_millis()))
}

pub struct CommandRouter {
    capture: CaptureService,
    sink: Arc<dyn FileSink>,
    injection: InjectionCodeState,
}

impl CommandRouter {
    pub fn new(
        capture: CaptureService,
        sink: Arc<dyn FileSink>,
        injection: InjectionCodeState,
    ) -> Self {
        Self {
            capture,
            sink,
            injection,
        }
    }

    pub fn injection_state(&self) -> &InjectionCodeState {
        &self.injection
    }

    /// Dispatch `request`. `requester` is the tab the request came from, if any.
    pub async fn handle(&self, request: Request, requester: Option<&TabHandle>) -> Response {
        match request {
            Request::Ping => Response::Ready,
            Request::GetInjectionCode => Response::InjectionCode(self.injection.get().await),
            Request::SetInjectionCode { injection_code } => {
                self.injection.set(injection_code).await;
                Response::InjectionCodeSet
            }
            Request::CaptureFullPage {
                tab_id,
                download,
                filename,
            } => match self
                .capture_full_page(tab_id, requester, download, filename)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    log_failure(&e);
                    Response::Failure(e.user_message())
                }
            },
        }
    }

    /// Parse one JSON request line and dispatch it.
    ///
    /// Capture requests without a `tabId` act on the browser's active tab.
    pub async fn handle_json(&self, line: &str) -> Response {
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting request {:?}: {}", line, e);
                return Response::Failure(format!("Invalid request: {e}"));
            }
        };

        let requester = match &request {
            Request::CaptureFullPage { tab_id: None, .. } => self.active_tab().await,
            _ => None,
        };
        self.handle(request, requester.as_ref()).await
    }

    async fn active_tab(&self) -> Option<TabHandle> {
        match self.capture.backend().active_tab().await {
            Ok(tab) => tab,
            Err(e) => {
                warn!("Could not resolve active tab: {}", e);
                None
            }
        }
    }

    async fn capture_full_page(
        &self,
        tab_id: Option<TabHandle>,
        requester: Option<&TabHandle>,
        download: bool,
        filename: Option<String>,
    ) -> Result<Response, CaptureError> {
        let tab = tab_id
            .or_else(|| requester.cloned())
            .ok_or(CaptureError::NoTab)?;
        let result = self.capture.capture_full_page(&tab).await?;

        if download {
            let filename = resolve_filename(filename.as_deref(), Utc::now());
            let path = self.sink.save(&filename, &result.png).await?;
            info!("Saved capture of tab {} to {}", tab, path.display());
            Ok(Response::Saved { filename })
        } else {
            Ok(Response::DataUrl(result.to_data_url()))
        }
    }
}

fn log_failure(e: &CaptureError) {
    match e.severity() {
        ErrorSeverity::Low => info!("Capture request rejected: {}", e),
        ErrorSeverity::Medium => warn!("Capture request failed: {}", e),
        ErrorSeverity::High | ErrorSeverity::Critical => error!("Capture request failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_capture_request() {
        let request: Request = serde_json::from_str(
            r#"{"action":"captureFullPage","tabId":42,"download":true,"filename":"a.png"}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            Request::CaptureFullPage {
                tab_id: Some(TabHandle::new("42")),
                download: true,
                filename: Some("a.png".to_string()),
            }
        );

        let bare: Request = serde_json::from_str(r#"{"action":"captureFullPage"}"#).unwrap();
        assert_eq!(
            bare,
            Request::CaptureFullPage {
                tab_id: None,
                download: false,
                filename: None,
            }
        );
    }

    #[test]
    fn test_parse_other_requests() {
        let ping: Request = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(ping, Request::Ping);

        let set: Request =
            serde_json::from_str(r#"{"action":"setInjectionCode","injectionCode":"x()"}"#)
                .unwrap();
        assert_eq!(
            set,
            Request::SetInjectionCode {
                injection_code: Some("x()".to_string())
            }
        );

        assert!(serde_json::from_str::<Request>(r#"{"action":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<Request>(r#"{"action":"captureFullPage","tabId":[1]}"#)
            .is_err());
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(Response::Ready.to_json(), json!({"ok": true}));
        assert_eq!(
            Response::Failure("No tabId".to_string()).to_json(),
            json!({"ok": false, "error": "No tabId"})
        );
        assert_eq!(
            Response::InjectionCode(None).to_json(),
            json!({"success": true, "injectionCode": null})
        );
        assert_eq!(
            serde_json::to_string(&Response::Saved {
                filename: "f.png".to_string()
            })
            .unwrap(),
            r#"{"filename":"f.png","ok":true}"#
        );
        assert!(!Response::Failure(String::new()).is_ok());
    }

    #[test]
    fn test_resolve_filename() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(resolve_filename(None, now), "fullpage_1700000000123.png");
        assert_eq!(resolve_filename(Some("  "), now), "fullpage_1700000000123.png");
        assert_eq!(resolve_filename(Some("a/b:c.png"), now), "a_b_c.png");
    }

    #[tokio::test]
    async fn test_directory_sink_creates_directories() {
        let root = std::env::temp_dir().join(format!("pagecapture-sink-{}", uuid::Uuid::new_v4()));
        let sink = DirectorySink::new(root.join("nested"));

        let path = sink.save("shot.png", b"png-bytes").await.unwrap();
        assert_eq!(path, root.join("nested").join("shot.png"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"png-bytes");

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
