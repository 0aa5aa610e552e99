use clap::Parser;
use pagecapture::{
    setup_logging, validate_config, validate_config_file, Cli, CliRunner, Commands, Config,
    PrometheusExporter,
};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting pagecapture v{}", env!("CARGO_PKG_VERSION"));

    // Validation needs no browser
    if let Commands::Validate { config } = &args.command {
        return validate_config_file(config).await;
    }

    // Load configuration
    let config = load_config(&args).await?;

    if let Some(port) = config.metrics_port {
        PrometheusExporter::new(port).start()?;
    }

    // Setup graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    // Connect to (or launch) the browser
    let cli_runner = CliRunner::new(config, shutdown_tx).await?;

    // Start the application based on command
    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    // Graceful shutdown
    info!("Shutting down...");
    cli_runner.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    info!("pagecapture stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        // Load from file
        let config_content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&config_content)?
    } else {
        // Use default configuration
        Config::default()
    };

    // Override with CLI arguments
    if let Some(url) = &args.debugging_url {
        config.browser.debugging_url = Some(url.clone());
    }

    if let Some(chrome_path) = &args.chrome_path {
        config.browser.chrome_path = Some(chrome_path.clone());
    }

    if args.headful {
        config.browser.headless = false;
    }

    if let Some(timeout) = args.timeout {
        config.capture.capture_timeout = Duration::from_secs(timeout);
    }

    if let Some(output_dir) = &args.output_dir {
        config.output_dir = output_dir.clone();
    }

    if let Some(port) = args.metrics_port {
        config.metrics_port = Some(port);
    }

    // Validate configuration
    validate_config(&config)?;

    info!("Configuration loaded successfully");
    match &config.browser.debugging_url {
        Some(url) => info!("Browser endpoint: {}", url),
        None => info!("Browser: launch (headless: {})", config.browser.headless),
    }
    info!("Capture timeout: {:?}", config.capture.capture_timeout);

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to create SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT");
            }
            _ = terminate => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
