use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcplet::{Config, DhcpServer, Result, persist};

#[derive(Parser)]
#[command(name = "dhcplet")]
#[command(author, version, about = "A small DHCPv4 server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "dhcplet.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on the configured interfaces.
    Run,
    /// Print the effective configuration.
    ShowConfig,
    /// Print the contents of a lease file.
    ListLeases { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = Config::load_or_create(&cli.config).await?;
            info!("Starting dhcplet with config {:?}", cli.config);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let server = DhcpServer::start(config, shutdown_rx).await?;

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received shutdown signal, draining...");
                    let _ = shutdown_tx.send(true);
                }
            });

            server.join().await
        }
        Commands::ShowConfig => {
            let config = Config::load_or_create(&cli.config).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases { file } => {
            let config = Config::load_or_create(&cli.config).await?;
            let leases = persist::load(&file).await?;

            // The lease file only stores start times; the lease duration
            // comes from the interface that owns the file.
            let lease_seconds = config
                .interfaces
                .iter()
                .find(|interface| interface.lease_file.as_deref() == Some(file.as_path()))
                .map(|interface| interface.lease_seconds);
            let now = Utc::now().timestamp().max(0) as u64;

            println!(
                "{:<20} {:<16} {:<24} {:<8}",
                "Hardware address", "IP Address", "Lease start", "State"
            );
            println!("{}", "-".repeat(70));

            for lease in &leases {
                let start = DateTime::from_timestamp(lease.start_secs as i64, 0)
                    .map(|stamp| stamp.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| format!("@{}", lease.start_secs));

                let state = match lease_seconds {
                    Some(secs) if now.saturating_sub(lease.start_secs) > u64::from(secs) => {
                        "expired"
                    }
                    Some(_) => "active",
                    None => "unknown",
                };

                println!(
                    "{:<20} {:<16} {:<24} {:<8}",
                    lease.hw.to_string(),
                    lease.ip.to_string(),
                    start,
                    state
                );
            }

            println!();
            println!("Total amount of leases: {}", leases.len());
            Ok(())
        }
    }
}
