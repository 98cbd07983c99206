#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use truthgate_core::config::ENV_CONFIG_PATH;
use truthgate_core::tracing_helpers::initialize_tracing;
use truthgate_core::ConfigStore;

#[derive(Parser)]
#[command(name = "truthgate-gateway", version, about = "Secure edge gateway for a local IPFS node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Configuration file (falls back to $TRUTHGATE_CONFIG, then
        /// ./truthgate.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse the configuration and print the effective domain table.
    Check {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./truthgate.toml"))
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => {
            let path = config_path(config);
            let store = ConfigStore::load(&path).await?;
            info!("configuration loaded from {:?}", path);
            truthgate_gateway::run(store).await?;
        }
        Command::Check { config } => {
            let path = config_path(config);
            let store = ConfigStore::load(&path).await?;
            let current = store.current();
            println!("production: {}", current.production);
            for record in current.domains.iter() {
                println!(
                    "{} -> {} (tls: {}, ipns: {})",
                    record.domain,
                    record.site_mfs_path(),
                    record.use_tls,
                    record.ipns_key_name.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}
