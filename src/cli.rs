use crate::{
    dither_image, install_prometheus, list_destinations, router, serve, AppState, BrowserPool,
    ChromeCapturer, Config, DriverType, LpDispatcher, RasterEncoder, RenderContext,
    TemplateRenderer,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "print-endpoint")]
#[command(about = "Render HTML receipts and print them on thermal printers")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Print width in pixels")]
    pub width: Option<u32>,

    #[arg(long, help = "Browser pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, help = "Capture timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Directory for capture artifacts")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP print endpoint
    Serve {
        #[arg(short, long, help = "Listen address, e.g. 0.0.0.0:3000")]
        bind: Option<String>,

        #[arg(short, long, help = "Printer queue name")]
        printer: Option<String>,

        #[arg(long, help = "Driver type (epson, epson_esc_star, star)")]
        driver: Option<DriverType>,

        #[arg(long, help = "Launch browsers on first use instead of at startup")]
        lazy_browsers: bool,
    },

    /// Render a template with JSON data to HTML
    Render {
        #[arg(short, long, help = "Template file")]
        template: PathBuf,

        #[arg(short, long, help = "JSON data file")]
        data: Option<PathBuf>,

        #[arg(short, long, help = "Output file (default: stdout)")]
        output: Option<PathBuf>,

        #[arg(long, help = "Leave out the dither script")]
        no_dither: bool,
    },

    /// Dither an image the way printed documents do
    Dither {
        #[arg(short, long, help = "Input image")]
        input: PathBuf,

        #[arg(short, long, help = "Output PNG")]
        output: PathBuf,

        #[arg(long, default_value = "1", help = "Downscale factor")]
        scale: i64,

        #[arg(long, help = "Luminance threshold (default: 150)")]
        threshold: Option<u8>,
    },

    /// Encode an image into a printer device buffer
    Encode {
        #[arg(short, long, help = "Input image")]
        input: PathBuf,

        #[arg(short, long, help = "Output buffer file")]
        output: PathBuf,

        #[arg(long, help = "Driver type (epson, epson_esc_star, star)")]
        driver: Option<DriverType>,
    },

    /// List printer queues known to CUPS
    Printers,

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Apply global command-line overrides on top of a loaded configuration
pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(width) = args.width {
        config.print_width = width;
    }
    if let Some(pool_size) = args.pool_size {
        config.browser_pool_size = pool_size;
    }
    if let Some(timeout) = args.timeout {
        config.capture_timeout = Duration::from_secs(timeout);
    }
    if let Some(temp_dir) = &args.temp_dir {
        config.temp_dir = temp_dir.clone();
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Serve {
                bind,
                printer,
                driver,
                lazy_browsers,
            } => self.run_server(bind, printer, driver, lazy_browsers).await,
            Commands::Render {
                template,
                data,
                output,
                no_dither,
            } => self.run_render(template, data, output, no_dither).await,
            Commands::Dither {
                input,
                output,
                scale,
                threshold,
            } => self.run_dither(input, output, scale, threshold).await,
            Commands::Encode {
                input,
                output,
                driver,
            } => self.run_encode(input, output, driver).await,
            Commands::Printers => self.show_printers().await,
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_server(
        &self,
        bind: Option<String>,
        printer: Option<String>,
        driver: Option<DriverType>,
        lazy_browsers: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut config = self.config.clone();
        if let Some(bind) = bind {
            config.listen_addr = bind;
        }
        if let Some(printer) = printer {
            config.printer.queue_name = printer;
        }
        if let Some(driver) = driver {
            config.printer.driver_type = driver;
        }
        config.validate()?;

        let prometheus = match install_prometheus() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Metrics disabled: {}", e);
                None
            }
        };

        let pool = BrowserPool::new(config.clone());
        if !lazy_browsers {
            pool.warm_up().await;
        }
        let _health_task = pool.start_health_check_task(Duration::from_secs(30));

        let capturer = Arc::new(ChromeCapturer::new(
            pool.clone(),
            config.viewport_height,
            config.capture_timeout,
            config.network_idle_window,
        ));
        let sink = Arc::new(LpDispatcher::new());
        let state =
            AppState::build(&config, capturer, sink, Some(pool.clone()), prometheus).await?;
        let _reaper = state.arena.clone().start_reaper(config.reap_interval);

        info!(
            "Printing to queue {} ({:?}) at {}px",
            config.printer.queue_name, config.printer.driver_type, config.print_width
        );

        let listener = TcpListener::bind(&config.listen_addr).await?;
        serve(listener, router(state, config.max_body_bytes), shutdown_signal()).await?;

        pool.shutdown().await;
        Ok(())
    }

    pub async fn run_render(
        &self,
        template: PathBuf,
        data: Option<PathBuf>,
        output: Option<PathBuf>,
        no_dither: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let source = fs::read_to_string(&template)
            .await
            .with_context(|| format!("reading template {}", template.display()))?;
        let context = match data {
            Some(path) => {
                let raw = fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading data {}", path.display()))?;
                let value: serde_json::Value = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing data {}", path.display()))?;
                RenderContext::from_value(value)
            }
            None => RenderContext::default(),
        };

        let renderer = TemplateRenderer::new();
        let html = if no_dither {
            renderer.render(&source, &context)?
        } else {
            renderer.render_document(&source, &context)?
        };

        match output {
            Some(path) => {
                fs::write(&path, html).await?;
                println!("Rendered {} to {}", template.display(), path.display());
            }
            None => println!("{html}"),
        }
        Ok(())
    }

    pub async fn run_dither(
        &self,
        input: PathBuf,
        output: PathBuf,
        scale: i64,
        threshold: Option<u8>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let image =
            image::open(&input).with_context(|| format!("opening image {}", input.display()))?;
        let dithered = dither_image(&image, scale, threshold);
        dithered.save(&output)?;
        println!(
            "Dithered {} -> {} ({}x{})",
            input.display(),
            output.display(),
            dithered.width(),
            dithered.height()
        );
        Ok(())
    }

    pub async fn run_encode(
        &self,
        input: PathBuf,
        output: PathBuf,
        driver: Option<DriverType>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let image =
            image::open(&input).with_context(|| format!("opening image {}", input.display()))?;
        let driver = driver.unwrap_or(self.config.printer.driver_type);
        let buffer = RasterEncoder::new(driver, self.config.commands.clone()).encode(&image)?;
        fs::write(&output, &buffer).await?;
        println!(
            "Encoded {} for {:?}: {} bytes written to {}",
            input.display(),
            driver,
            buffer.len(),
            output.display()
        );
        Ok(())
    }

    pub async fn show_printers(&self) -> Result<(), Box<dyn std::error::Error>> {
        let destinations = list_destinations().await?;
        if destinations.is_empty() {
            println!("No printer queues found");
        }
        for name in destinations {
            println!("{name}");
        }
        Ok(())
    }

    pub async fn validate_config(
        &self,
        config_path: PathBuf,
    ) -> Result<(), Box<dyn std::error::Error>> {
        println!("Validating configuration: {}", config_path.display());

        let config_content = fs::read_to_string(&config_path).await?;
        let config: Config = serde_json::from_str(&config_content)?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Listen address: {}", config.listen_addr);
        println!("  Print width: {}px", config.print_width);
        println!(
            "  Printer: {} ({:?})",
            config.printer.queue_name, config.printer.driver_type
        );
        println!(
            "  Workers: {} (queue capacity {})",
            config.worker_count, config.queue_capacity
        );
        println!("  Browser pool size: {}", config.browser_pool_size);
        println!("  Capture timeout: {:?}", config.capture_timeout);
        println!("  Temp dir: {}", config.temp_dir.display());

        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
