//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// TLS-terminating reverse proxy and Policy Enforcement Point
#[derive(Parser, Debug)]
#[command(name = "pep-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "PEP_PROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Listen address, overrides `frontend.addr`
    #[arg(short, long, env = "PEP_PROXY_ADDR")]
    pub addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "PEP_PROXY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format for the system log (text, json)
    #[arg(long, env = "PEP_PROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy (default)
    Serve,

    /// Load configuration, certificates and CRLs, report, and exit
    Check,
}
