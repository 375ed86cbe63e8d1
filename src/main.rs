//! portmux CLI - multiplex TCP port forwards over pooled SSH sessions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portmux_core::{Config, Runtime};

/// portmux - local/remote/SOCKS5 tunnels over shared SSH sessions
#[derive(Parser, Debug)]
#[command(name = "portmux")]
#[command(about = "Multiplex TCP port forwards over pooled SSH sessions")]
#[command(version)]
struct Cli {
    /// Enable verbose logging (same as [common] debug = true)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the configuration and run every forward until interrupted
    Run {
        /// Path to the INI configuration file
        #[arg(env = "PORTMUX_CONFIG")]
        config: PathBuf,
    },
    /// Validate the configuration and show what would run
    Check {
        /// Path to the INI configuration file
        #[arg(env = "PORTMUX_CONFIG")]
        config: PathBuf,

        /// Print the parsed state as JSON
        #[arg(long)]
        json: bool,
    },
}

fn setup_logging(debug: bool) {
    let default = if debug { "portmux=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let loaded = Config::load(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            setup_logging(cli.verbose || loaded.debug);
            for w in &loaded.warnings {
                warn!("{w}");
            }
            info!(
                servers = loaded.servers.len(),
                forwards = loaded.forwards.len(),
                "configuration loaded from {}",
                config.display()
            );

            let runtime = Runtime::new(loaded);
            runtime.start().await;
            info!("portmux running; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            info!("shutting down");
            runtime.stop().await;
            info!("portmux stopped");
            Ok(())
        }
        Commands::Check { config, json } => {
            let loaded = Config::load(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            setup_logging(cli.verbose || loaded.debug);
            for w in &loaded.warnings {
                warn!("{w}");
            }

            let runtime = Runtime::new(loaded);
            let snapshot = runtime.snapshot().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("servers:");
                for s in &snapshot.servers {
                    println!("  {}", s.name);
                }
                println!("forwards:");
                for f in &snapshot.forwards {
                    let note = match &f.status.last_error {
                        Some(e) => format!(" [{e}]"),
                        None => String::new(),
                    };
                    println!(
                        "  {} ({} via {}): {}{}",
                        f.name, f.direction, f.server, f.endpoints, note
                    );
                }
            }
            Ok(())
        }
    }
}
