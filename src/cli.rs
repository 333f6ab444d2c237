//! Command-line argument parsing for analytics-mcp.

use crate::config::Config;
use clap::Parser;
use std::path::PathBuf;

/// MCP tool server for a BI platform's REST API.
#[derive(Parser, Debug)]
#[command(name = "analytics-mcp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Platform API base URL (e.g., http://localhost:8088/api/v1)
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// Platform username
    #[arg(short = 'u', long, value_name = "USER")]
    pub username: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Authenticate once, report the result and exit
    #[arg(long)]
    pub check: bool,

    /// Print the tool definitions as JSON and exit
    #[arg(long)]
    pub list_tools: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Overrides config values with the ones given on the command line.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(url) = &self.base_url {
            config.platform.base_url = url.clone();
        }
        if let Some(user) = &self.username {
            config.platform.username = Some(user.clone());
        }
    }
}
