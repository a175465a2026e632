use clap::Parser;
use print_endpoint::{apply_overrides, setup_logging, Cli, CliRunner, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting print-endpoint v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config);

    if let Err(e) = cli_runner.run(args.command).await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }

    info!("print-endpoint stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&config_content)?
    } else {
        Config::default()
    };

    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Print width: {}px", config.print_width);
    info!("Browser pool size: {}", config.browser_pool_size);
    info!("Capture timeout: {:?}", config.capture_timeout);

    Ok(config)
}
