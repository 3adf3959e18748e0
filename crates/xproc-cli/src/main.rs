//! xproc - host or call a ProcessService from the command line.
//!
//! `xproc serve` prints `XPROC_PORT=<port>` on stdout once listening so a
//! parent process can read it. Logs go to stderr.

mod commands;
mod config;
mod service;
mod values;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::CliConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xproc")]
#[command(about = "Host and call xproc services")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the ProcessService on loopback TCP
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (0 = auto-assign)
        #[arg(short, long)]
        port: Option<u16>,

        /// Serve version 1 of the interface
        #[arg(long)]
        legacy: bool,

        /// Requests executed concurrently per caller
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Call one method on a running host and print the result as JSON
    Call {
        /// Host address, e.g. 127.0.0.1:4100
        addr: String,

        /// Method name, e.g. getCurrentTimeStamp
        method: String,

        /// Arguments in declaration order
        args: Vec<String>,

        /// Call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the interface descriptor as JSON
    Describe {
        /// Describe version 1 of the interface
        #[arg(long)]
        legacy: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut config = CliConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Serve {
            host,
            port,
            legacy,
            workers,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(workers) = workers {
                config.dispatcher.workers = workers;
            }

            let mut handle = commands::start_host(&config, legacy).await?;

            // Print port for the parent process to read (intentional stdout)
            println!("XPROC_PORT={}", handle.port);

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            handle.shutdown();
        }
        Command::Call {
            addr,
            method,
            args,
            timeout_ms,
        } => {
            if let Some(ms) = timeout_ms {
                config.connection.call_timeout = Duration::from_millis(ms);
            }
            let result = commands::call(&config, &addr, &method, &args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Describe { legacy } => {
            println!("{}", commands::describe(legacy)?);
        }
    }

    Ok(())
}
