//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the capture tool:
//! how to reach the browser, the timing and size parameters of the capture
//! pipeline, and the optional control channel.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the capture tool
///
/// # Examples
///
/// ```rust
/// use pagecapture::Config;
///
/// let config = Config::default();
/// assert_eq!(config.capture.height_ceiling, 45_000);
///
/// let config = Config {
///     max_html_chars: 50_000,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// How to reach (or launch) the browser whose tabs are captured
    pub browser: BrowserSettings,

    /// Pipeline timing, thresholds and size limits
    pub capture: CaptureSettings,

    /// Optional externally driven configuration channel
    pub control: ControlSettings,

    /// Directory where downloaded screenshots and prompt packages land
    pub output_dir: PathBuf,

    /// Character budget for the HTML snapshot embedded in a prompt package
    pub max_html_chars: usize,

    /// Serve Prometheus metrics on this port when set
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browser: BrowserSettings::default(),
            capture: CaptureSettings::default(),
            control: ControlSettings::default(),
            output_dir: PathBuf::from("captures"),
            max_html_chars: 100_000,
            metrics_port: None,
        }
    }
}

/// Browser connection settings
///
/// When `debugging_url` is set the tool connects to an already running
/// browser (for example one started with `--remote-debugging-port=9222`),
/// which is the way to capture tabs a person is actually looking at.
/// Otherwise a browser is launched with [`get_chrome_args`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// HTTP or WebSocket debugging endpoint of a running browser
    pub debugging_url: Option<String>,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Launch the browser without a window (default: true)
    pub headless: bool,

    /// Window width of a launched browser
    pub window_width: u32,

    /// Window height of a launched browser
    pub window_height: u32,

    /// Timeout for endpoint discovery and connection
    pub connect_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            debugging_url: None,
            chrome_path: None,
            headless: true,
            window_width: 1280,
            window_height: 800,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Parameters of the full-page capture pipeline
///
/// Buffers between 8 and 16 px and ceilings between 30 000 and 45 000 px
/// all work in practice; the defaults are the upper ends.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Debugging protocol version requested on attach
    pub protocol_version: String,

    /// Pause before detaching so pending protocol side effects flush
    pub detach_delay: Duration,

    /// Lazy-load forcing scroll loop
    pub scroll: ScrollSettings,

    /// Pause after a device metrics override so layout can re-flow
    pub resize_settle: Duration,

    /// Pixels added below the lowest visible element
    pub bottom_buffer_px: u32,

    /// Hard upper bound for viewport and clip height
    pub height_ceiling: u32,

    /// Tab width used when neither the tab nor the page report one
    pub fallback_width: u32,

    /// Tab height used when neither the tab nor the page report one
    pub fallback_height: u32,

    /// Upper bound on one whole capture request
    pub capture_timeout: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            protocol_version: "1.3".to_string(),
            detach_delay: Duration::from_millis(50),
            scroll: ScrollSettings::default(),
            resize_settle: Duration::from_millis(250),
            bottom_buffer_px: 16,
            height_ceiling: 45_000,
            fallback_width: 1280,
            fallback_height: 720,
            capture_timeout: Duration::from_secs(60),
        }
    }
}

/// Settings for the bounded polling loop that materializes lazy content
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScrollSettings {
    /// Maximum scroll-to-bottom rounds (default: 12)
    pub max_rounds: u32,

    /// Wait after each scroll so lazy-load observers fire (default: 450ms)
    pub round_settle: Duration,

    /// Wait after returning to the top (default: 250ms)
    pub top_settle: Duration,

    /// Height change below which the page counts as stable (default: 40px)
    pub stable_threshold_px: u32,
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            max_rounds: 12,
            round_settle: Duration::from_millis(450),
            top_settle: Duration::from_millis(250),
            stable_threshold_px: 40,
        }
    }
}

/// Control channel settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlSettings {
    /// Run the reconnecting control channel (default: false)
    pub enabled: bool,

    /// WebSocket endpoint that pushes configuration messages
    pub url: String,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "ws://localhost:8765".to_string(),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Check a configuration before anything is launched or attached
pub fn validate_config(config: &Config) -> Result<(), crate::CaptureError> {
    let invalid = |msg: &str| Err(crate::CaptureError::Configuration(msg.to_string()));
    let capture = &config.capture;

    if capture.protocol_version.trim().is_empty() {
        return invalid("Protocol version must not be empty");
    }
    if capture.scroll.max_rounds == 0 {
        return invalid("Scroll rounds must be greater than 0");
    }
    if capture.height_ceiling == 0 {
        return invalid("Height ceiling must be greater than 0");
    }
    if capture.fallback_width == 0 || capture.fallback_height == 0 {
        return invalid("Fallback dimensions must be greater than 0");
    }
    if capture.height_ceiling < capture.fallback_height {
        return invalid("Height ceiling must not be below the fallback height");
    }
    if capture.capture_timeout.is_zero() {
        return invalid("Capture timeout must be greater than 0");
    }
    if config.browser.window_width == 0 || config.browser.window_height == 0 {
        return invalid("Window dimensions must be greater than 0");
    }
    if config.max_html_chars == 0 {
        return invalid("HTML budget must be greater than 0");
    }
    if config.control.enabled && url::Url::parse(&config.control.url).is_err() {
        return invalid("Control channel URL is not a valid URL");
    }

    Ok(())
}

/// Generate Chrome command-line arguments for a launched browser
///
/// # Examples
///
/// ```rust
/// use pagecapture::{Config, get_chrome_args};
///
/// let config = Config::default();
/// let args = get_chrome_args(&config);
/// assert!(args.contains(&"--hide-scrollbars".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());

    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        format!(
            "--window-size={},{}",
            config.browser.window_width, config.browser.window_height
        ),
        format!("--user-data-dir=/tmp/pagecapture-profile-{}", unique_id),
    ];

    if config.browser.headless {
        args.push("--disable-gpu".to_string());
    }

    args
}

pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, crate::CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.browser.window_width, config.browser.window_height)
        .args(get_chrome_args(config));

    if !config.browser.headless {
        builder = builder.with_head();
    }

    if let Some(chrome_path) = &config.browser.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(crate::CaptureError::Configuration)
}
