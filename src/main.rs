//! PEP Proxy - TLS-terminating reverse proxy and Policy Enforcement Point
//!
//! SNI-routed, mutually authenticated, CRL-checked on both legs.

use std::process::ExitCode;

use chrono::DateTime;
use clap::Parser;
use tracing::{error, info, warn};

use pep_proxy::{
    Error, PlaneOutputs,
    cli::{Cli, Command},
    config::Config,
    pep::Proxy,
    setup_tracing,
};

/// `EX_CONFIG` from sysexits(3): bad configuration or trust material.
const EX_CONFIG: u8 = 78;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Log sinks come from the config file, so it is loaded before tracing.
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return exit_code(&e);
        }
    };

    // Setup tracing
    let planes = PlaneOutputs {
        data: &config.data_plane_logger.output,
        control: &config.control_plane_logger.output,
    };
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref(), planes) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check) => run_check(&config),
        Some(Command::Serve) | None => run_server(&config).await,
    }
}

fn load_config(cli: &Cli) -> pep_proxy::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(ref addr) = cli.addr {
        config.frontend.addr = addr.clone();
        config.validate()?;
    }
    Ok(config)
}

/// Build everything a server would, then exit
fn run_check(config: &Config) -> ExitCode {
    match Proxy::build(config) {
        Ok(proxy) => {
            println!("✅ Configuration valid");
            println!("   Listen: {}", proxy.addr());
            println!("   Services: {}", proxy.services());
            println!("   Server identities: {}", proxy.server_identities());
            println!("   Client identities: {}", proxy.client_identities());
            println!(
                "   Client auth: {}",
                if config.frontend.tls.client_auth { "required" } else { "off" }
            );
            println!("   CRLs valid until: {}", format_timestamp(proxy.crl_next_update()));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            exit_code(&e)
        }
    }
}

async fn run_server(config: &Config) -> ExitCode {
    let proxy = match Proxy::build(config) {
        Ok(p) => p,
        Err(e) => {
            error!(fatal = e.is_startup_fatal(), "Failed to start PEP proxy: {e}");
            return exit_code(&e);
        }
    };

    let crl_next_update = proxy.crl_next_update();
    if crl_next_update - chrono::Utc::now().timestamp() < 24 * 60 * 60 {
        warn!(
            next_update = %format_timestamp(crl_next_update),
            "A CRL expires within a day; restart with a fresh one before then"
        );
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %proxy.addr(),
        services = proxy.services(),
        client_auth = config.frontend.tls.client_auth,
        "Starting PEP proxy"
    );

    // Run with graceful shutdown
    if let Err(e) = proxy.run().await {
        error!("PEP proxy error: {e}");
        return exit_code(&e);
    }

    info!("PEP proxy shutdown complete");
    ExitCode::SUCCESS
}

/// Configuration and trust errors exit with `EX_CONFIG`, anything else with 1.
fn exit_code(error: &Error) -> ExitCode {
    if error.is_startup_fatal() {
        ExitCode::from(EX_CONFIG)
    } else {
        ExitCode::FAILURE
    }
}

fn format_timestamp(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0).map_or_else(|| ts.to_string(), |t| t.to_rfc3339())
}
