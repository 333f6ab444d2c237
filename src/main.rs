//! analytics-mcp - MCP tool server for a BI platform's REST API.

use analytics_mcp::app::App;
use analytics_mcp::cli::Cli;
use analytics_mcp::config::Config;
use analytics_mcp::logging;
use anyhow::Context;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    match &cli.log_file {
        Some(path) => logging::init_file_logging(path),
        None => logging::init_stderr_logging(),
    }

    if let Err(e) = run(cli).await {
        let category = e
            .downcast_ref::<analytics_mcp::error::Error>()
            .map(|e| e.category())
            .unwrap_or("Error");
        error!("{}: {:#}", category, e);
        eprintln!("{category}: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load_from_file(&config_path)?;
    config.apply_env_overrides();
    cli.apply_to(&mut config);

    let app = App::from_config(&config)?;

    if cli.list_tools {
        let definitions = serde_json::to_string_pretty(&app.registry().definitions())
            .context("failed to encode tool definitions")?;
        println!("{definitions}");
        return Ok(());
    }

    if cli.check {
        app.check().await?;
        println!("OK");
        return Ok(());
    }

    tokio::select! {
        result = app.serve_stdio() => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling outstanding calls");
            app.shutdown();
        }
    }
    Ok(())
}
