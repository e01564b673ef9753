mod commands;
mod config;
mod utils;

use clap::{Parser, Subcommand};
use config::{QueueArgs, Settings};
use ferry_transport::DEFAULT_RECONNECT_INTERVAL;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Ferry - move I/O buffers from a socket or serial port to a parser")]
struct Cli {
    /// JSON settings file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    queue: QueueArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read from a TCP server, reconnecting when the connection drops
    Tcp {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long)]
        port: u16,

        /// Delay between reconnect attempts
        #[arg(
            long,
            default_value_t = DEFAULT_RECONNECT_INTERVAL.as_millis() as u64,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        reconnect_ms: u64,
    },
    /// Receive UDP datagrams on a local address
    Udp {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long)]
        port: u16,
    },
    /// Read from a serial port
    #[cfg(unix)]
    Serial(commands::SerialArgs),
    /// Run an in-process producer against a slow parser and report losses
    Soak {
        #[arg(long, default_value_t = 10_000)]
        messages: u64,

        /// Time the parser spends on each buffer
        #[arg(long, default_value_t = 0)]
        consumer_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply(&cli.queue);
    settings.validate()?;

    match cli.command {
        Commands::Tcp {
            host,
            port,
            reconnect_ms,
        } => {
            commands::run_tcp(&settings, &host, port, Duration::from_millis(reconnect_ms)).await?;
        }
        Commands::Udp { host, port } => {
            commands::run_udp(&settings, &host, port).await?;
        }
        #[cfg(unix)]
        Commands::Serial(args) => {
            commands::run_serial(&settings, &args).await?;
        }
        Commands::Soak {
            messages,
            consumer_delay_ms,
        } => {
            let delay = Duration::from_millis(consumer_delay_ms);
            let report = tokio::task::spawn_blocking(move || {
                commands::run_soak(&settings, messages, delay).map_err(|e| e.to_string())
            })
            .await??;

            println!("Soak run ({:.2?}):", report.elapsed);
            println!("  Produced:     {}", report.produced);
            println!("  Delivered:    {}", report.delivered);
            println!("  Dropped:      {}", report.dropped);
            println!("  Out of order: {}", report.out_of_order);
        }
    }

    Ok(())
}
