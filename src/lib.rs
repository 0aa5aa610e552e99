//! # pagecapture
//!
//! Full-page screenshots of live browser tabs over the Chrome DevTools
//! Protocol, packaged together with the page's HTML into a prompt for
//! dark-pattern analysis.
//!
//! A capture attaches a debugger to one tab, scrolls the page until
//! lazy-loaded content stops growing, measures the lowest visible element,
//! stretches the viewport to fit it, takes a clipped PNG from the
//! compositor surface and then puts the viewport back exactly as it was.
//!
//! ## Pipeline
//!
//! | Step | Module | Notes |
//! |------|--------|-------|
//! | Attach / detach | [`session`] | One session per tab, detach always attempted |
//! | Lazy-load scroll | [`probe`] | Up to 12 rounds, stops when height settles within 40px |
//! | Measure | [`probe`] | Viewport size and visible extent (+16px buffer) |
//! | Resize | [`viewport`] | Desktop metrics, clamped to 45 000px |
//! | Screenshot | [`capture`] | PNG clipped to the visible extent |
//! | Restore | [`viewport`] | Original tab size reapplied even on failure |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagecapture::{CaptureService, ChromeBackend, Config, DebugBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.browser.debugging_url = Some("http://127.0.0.1:9222".to_string());
//!
//!     let backend = Arc::new(ChromeBackend::new(&config).await?);
//!     let tab = backend.active_tab().await?.expect("an open tab");
//!
//!     let service = CaptureService::new(backend, config.capture.clone());
//!     let capture = service.capture_full_page(&tab).await?;
//!     println!("Captured {}x{} ({} bytes)", capture.width, capture.height, capture.png.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### Capture the active tab of a running browser
//! ```bash
//! pagecapture --debugging-url http://127.0.0.1:9222 capture --output page.png
//! ```
//!
//! ### Export a prompt package
//! ```bash
//! pagecapture --debugging-url http://127.0.0.1:9222 export --tab <TARGET_ID>
//! ```
//!
//! ### JSON request loop
//! ```bash
//! echo '{"action":"captureFullPage","download":true}' | pagecapture serve
//! ```

/// Configuration and settings
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Debugger attachment lifecycle and the backend abstraction
pub mod session;

/// Page measurements and the lazy-load scroll loop
pub mod probe;

/// Device metrics overrides and restoration
pub mod viewport;

/// Full-page capture orchestration
pub mod capture;

/// Chromium backend over the DevTools protocol
pub mod browser;

/// Action-tagged request dispatch
pub mod router;

/// Injection-code state and the reconnecting control channel
pub mod control;

/// Prompt package assembly
pub mod prompt;

/// Command-line interface implementation
pub mod cli;

/// Capture metrics and Prometheus export
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use browser::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use control::*;
pub use error::*;
pub use metrics::*;
pub use probe::*;
pub use prompt::*;
pub use router::*;
pub use session::*;
pub use utils::*;
pub use viewport::*;
