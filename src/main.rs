use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use p4_changelist_sync::{mapping, ConnectionRef, LocalGroupId, RemoteChangelistId, SyncConfig};

/// Inspect and repair the local group <-> changelist mapping
#[derive(Parser)]
#[command(name = "p4cl-mapping", author, version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of ~/.config/p4-changelist-sync/config.yaml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Mapping file to use instead of the configured one
    #[arg(long, global = true)]
    mapping: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every persisted link
    Show {
        #[arg(long, help = "Print the links as JSON")]
        json: bool,
    },
    /// Report inconsistencies between the two mapping tables
    Check,
    /// Drop every link of a local group
    Forget {
        /// Local group id
        local_id: String,
    },
    /// Drop the link of one remote changelist
    Unbind {
        connection: String,
        number: i64,
    },
}

#[derive(Serialize)]
struct LinkRow {
    connection: String,
    number: i64,
    local_group: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SyncConfig::load_with_env(path, |key| std::env::var(key).ok())?,
        None => SyncConfig::load()?,
    };
    let mapping_path = cli.mapping.clone().unwrap_or(config.mapping_path.clone());
    let store = mapping::load(&mapping_path, &config.default_changelist_name)?;

    match cli.command {
        Commands::Show { json } => {
            let rows: Vec<LinkRow> = store
                .snapshot()
                .links()
                .map(|(remote, local)| LinkRow {
                    connection: remote.connection.to_string(),
                    number: remote.number,
                    local_group: local.to_string(),
                })
                .collect();

            if json {
                let output =
                    serde_json::to_string_pretty(&rows).context("Failed to serialize links")?;
                println!("{}", output);
            } else if rows.is_empty() {
                println!("No links in {:?}", mapping_path);
            } else {
                for row in rows {
                    println!("{}@{}\t{}", row.connection, row.number, row.local_group);
                }
            }
        }
        Commands::Check => {
            let problems = store.check_invariants();
            if problems.is_empty() {
                println!("{} link(s), no problems found", store.snapshot().len());
            } else {
                for problem in &problems {
                    eprintln!("p4cl-mapping: {}", problem);
                }
                std::process::exit(1);
            }
        }
        Commands::Forget { local_id } => {
            let detached = store.forget_local(&LocalGroupId::new(local_id.as_str()));
            if detached.is_empty() {
                println!("Local group {} has no links", local_id);
            } else {
                mapping::save(&store, &mapping_path)?;
                for remote in detached.values() {
                    println!("Forgot {}", remote);
                }
            }
        }
        Commands::Unbind { connection, number } => {
            let remote = RemoteChangelistId::new(ConnectionRef::new(connection), number);
            match store.unbind(&remote) {
                Some(local) => {
                    mapping::save(&store, &mapping_path)?;
                    println!("Unbound {} from local group {}", remote, local);
                }
                None => println!("{} is not linked", remote),
            }
        }
    }

    Ok(())
}
