use crate::{
    load_template, package_base_name, validate_url, CaptureError, CaptureService, ChromeBackend,
    CommandRouter, Config, ControlChannel, DebugBackend, DirectorySink, InjectionCodeState,
    PromptPackage, Request, Response, TabHandle,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pagecapture")]
#[command(about = "Full-page screenshot and prompt package capture over the DevTools protocol")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Debugging endpoint of a running browser (http://host:port or ws://...)")]
    pub debugging_url: Option<String>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Show the window of a launched browser")]
    pub headful: bool,

    #[arg(long, help = "Capture timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Directory for downloaded screenshots and prompt packages")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture one tab as a full-page PNG
    Capture {
        #[arg(short, long, help = "Target id of the tab to capture (default: active tab)")]
        tab: Option<String>,

        #[arg(short, long, help = "Open this URL in a new tab and capture it")]
        url: Option<String>,

        #[arg(short, long, help = "Output file path (default: print a data URL)")]
        output: Option<PathBuf>,
    },

    /// List open tabs
    Tabs,

    /// Capture a tab and write a prompt package (.md + .png)
    Export {
        #[arg(short, long, help = "Target id of the tab to export (default: active tab)")]
        tab: Option<String>,

        #[arg(short, long, help = "Open this URL in a new tab and export it")]
        url: Option<String>,

        #[arg(long, help = "Prompt template file (default: built-in template)")]
        template: Option<PathBuf>,
    },

    /// Answer JSON requests read line by line from stdin
    Serve {
        #[arg(long, help = "Connect the control channel even if disabled in the config")]
        control: bool,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

pub struct CliRunner {
    pub config: Config,
    pub backend: Arc<ChromeBackend>,
    pub service: CaptureService,
    pub router: CommandRouter,
    shutdown: broadcast::Sender<()>,
}

impl CliRunner {
    pub async fn new(
        config: Config,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let backend = Arc::new(ChromeBackend::new(&config).await?);
        let service = CaptureService::new(backend.clone(), config.capture.clone());
        let router = CommandRouter::new(
            service.clone(),
            Arc::new(DirectorySink::new(config.output_dir.clone())),
            InjectionCodeState::init(),
        );

        Ok(Self {
            config,
            backend,
            service,
            router,
            shutdown,
        })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Capture { tab, url, output } => self.run_capture(tab, url, output).await,
            Commands::Tabs => self.run_tabs().await,
            Commands::Export { tab, url, template } => self.run_export(tab, url, template).await,
            Commands::Serve { control } => self.run_serve(control).await,
            Commands::Validate { config } => validate_config_file(&config).await,
        }
    }

    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
    }

    /// Open `url` in a new tab, use the given target id, or fall back to the active tab.
    pub async fn resolve_tab(
        &self,
        tab: Option<String>,
        url: Option<String>,
    ) -> Result<TabHandle, Box<dyn std::error::Error>> {
        if let Some(url) = url {
            let url = validate_url(&url)?;
            info!("Opening {}", url);
            return Ok(self.backend.open_tab(url.as_str()).await?);
        }
        if let Some(tab) = tab {
            return Ok(TabHandle::new(tab));
        }
        Ok(self.backend.active_tab().await?.ok_or(CaptureError::NoTab)?)
    }

    pub async fn run_capture(
        &self,
        tab: Option<String>,
        url: Option<String>,
        output: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let tab = self.resolve_tab(tab, url).await?;
        info!("Capturing tab {}", tab);

        let result = self.service.capture_full_page(&tab).await?;

        match output {
            Some(output) => {
                if let Some(parent) = output.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(&output, &result.png).await?;

                println!("Full page captured successfully:");
                println!("  Tab: {}", result.tab);
                println!("  Output: {}", output.display());
                println!("  Dimensions: {}x{}", result.width, result.height);
                println!("  Visible extent: {}px", result.visible_extent);
                println!("  Scroll rounds: {}", result.scroll_rounds);
                println!("  Size: {}", crate::format_bytes(result.png.len()));
                println!("  Duration: {}", crate::format_duration(result.duration));
            }
            None => println!("{}", result.to_data_url()),
        }

        Ok(())
    }

    pub async fn run_tabs(&self) -> Result<(), Box<dyn std::error::Error>> {
        let tabs = self.backend.list_tabs().await?;
        if tabs.is_empty() {
            println!("No open tabs");
            return Ok(());
        }

        for tab in tabs {
            println!("{}  {}  {}", tab.handle, tab.title, tab.url);
        }
        Ok(())
    }

    pub async fn run_export(
        &self,
        tab: Option<String>,
        url: Option<String>,
        template: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let tab = self.resolve_tab(tab, url).await?;
        let template = load_template(template.as_deref()).await?;

        println!("1/3 Reading page HTML");
        let snapshot = self
            .service
            .page_snapshot(&tab, self.config.max_html_chars)
            .await?;
        if snapshot.html.is_empty() {
            return Err("No HTML returned from the page".into());
        }

        let generated_at = Utc::now();
        let base = package_base_name(&snapshot.url, &generated_at);
        let screenshot_filename = format!("{base}.png");
        let md_filename = format!("{base}.md");

        println!("2/3 Capturing full-page screenshot");
        let request = Request::CaptureFullPage {
            tab_id: Some(tab.clone()),
            download: true,
            filename: Some(screenshot_filename.clone()),
        };
        if let Response::Failure(error) = self.router.handle(request, None).await {
            return Err(error.into());
        }

        println!("3/3 Writing prompt package");
        let package = PromptPackage {
            url: snapshot.url,
            title: snapshot.title,
            generated_at,
            screenshot_filename: screenshot_filename.clone(),
            truncated_html: snapshot.html,
        };
        let md_path = self.config.output_dir.join(&md_filename);
        fs::create_dir_all(&self.config.output_dir).await?;
        fs::write(&md_path, package.to_markdown(&template)).await?;

        println!("Done:");
        println!("  {}", md_path.display());
        println!(
            "  {}",
            self.config.output_dir.join(&screenshot_filename).display()
        );
        if snapshot.original_length > self.config.max_html_chars {
            println!(
                "  HTML truncated from {} to {} chars",
                snapshot.original_length, self.config.max_html_chars
            );
        }
        Ok(())
    }

    pub async fn run_serve(&self, force_control: bool) -> Result<(), Box<dyn std::error::Error>> {
        if self.config.control.enabled || force_control {
            let channel = ControlChannel::new(
                self.config.control.clone(),
                self.router.injection_state().clone(),
            );
            tokio::spawn(channel.run(self.shutdown.subscribe()));
        }

        info!("Serving JSON requests on stdin");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut updates = self.router.injection_state().subscribe();
        let mut stdout = tokio::io::stdout();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let response = self.router.handle_json(line).await;
                    write_json_line(&mut stdout, &response).await?;
                }
                update = updates.recv() => match update {
                    Ok(update) => write_json_line(&mut stdout, &update).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} injection code notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("stdin closed, stopping");
        Ok(())
    }
}

pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<(), Box<dyn std::error::Error>>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn validate_config_file(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration: {}", config_path.display());

    let config_content = fs::read_to_string(config_path).await?;
    let config: Config = serde_json::from_str(&config_content)?;
    crate::validate_config(&config)?;

    println!("Configuration is valid:");
    match &config.browser.debugging_url {
        Some(url) => println!("  Browser: connect to {url}"),
        None => println!(
            "  Browser: launch ({})",
            if config.browser.headless { "headless" } else { "headful" }
        ),
    }
    println!("  Protocol version: {}", config.capture.protocol_version);
    println!("  Scroll rounds: {}", config.capture.scroll.max_rounds);
    println!("  Height ceiling: {}px", config.capture.height_ceiling);
    println!("  Bottom buffer: {}px", config.capture.bottom_buffer_px);
    println!(
        "  Capture timeout: {}",
        crate::format_duration(config.capture.capture_timeout)
    );
    println!("  Output directory: {}", config.output_dir.display());
    if config.control.enabled {
        println!("  Control channel: {}", config.control.url);
    }

    Ok(())
}

/// Install the fmt subscriber. Logs go to stderr so stdout stays free for data.
pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
