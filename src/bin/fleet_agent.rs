//! Node agent binary.
//!
//! Loads the YAML agent configuration, then runs one worker per managed
//! cluster until SIGTERM/SIGINT. Exit codes: 0 clean shutdown, 1
//! configuration error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use nebula_fleet::agent;
use nebula_fleet::config::{AgentConfig, LogFormat, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "fleet-agent", about = "Nebula fleet node agent")]
struct AgentOpts {
    /// Path to the agent configuration file.
    #[arg(
        long,
        env = "FLEET_AGENT_CONFIG",
        default_value = "/etc/fleet-agent/config.yml"
    )]
    config: PathBuf,

    /// Tracing filter, e.g. `info` or `nebula_fleet=debug`.
    #[arg(long, env = "FLEET_AGENT_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "FLEET_AGENT_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = AgentOpts::parse();
    init_tracing(&opts.log_level, opts.log_format);

    let config = match AgentConfig::load(&opts.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    match agent::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "agent failed");
            ExitCode::from(1)
        }
    }
}
