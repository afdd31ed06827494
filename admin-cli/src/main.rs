use clap::{Parser, Subcommand, ValueEnum};
use realmkeeper::storage::{JsonFileStore, RegistrySnapshot, SqliteStore, StateStore};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "realmkeeper-admin")]
#[command(about = "Operator tools for Realm Keeper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Json,
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Print fresh UUIDv4 keys, one per line
    Generate {
        #[arg(short, long, default_value_t = 10)]
        count: usize,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Summarize a state store without starting the bot
    Inspect {
        #[arg(short, long, value_enum, default_value_t = Backend::Json)]
        backend: Backend,
        #[arg(short, long, default_value = "realmkeeper.json")]
        path: PathBuf,
        /// Dump the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

fn generate_keys(count: usize) -> Vec<String> {
    (0..count).map(|_| uuid::Uuid::new_v4().to_string()).collect()
}

async fn open(backend: Backend, path: &Path) -> anyhow::Result<Box<dyn StateStore>> {
    Ok(match backend {
        Backend::Json => Box::new(JsonFileStore::new(path, false)),
        Backend::Sqlite => {
            if !path.exists() {
                anyhow::bail!("{} does not exist", path.display());
            }
            Box::new(SqliteStore::connect(path, 1).await?)
        }
    })
}

fn summarize(snapshot: &RegistrySnapshot) -> String {
    if snapshot.communities.is_empty() {
        return "No communities configured.".to_string();
    }

    let mut lines = vec![format!(
        "{} communities, {} available keys (state version {})",
        snapshot.communities.len(),
        snapshot.key_count(),
        snapshot.version
    )];
    for community in &snapshot.communities {
        let claimants: std::collections::HashSet<_> =
            community.claims.iter().map(|c| c.claimant_id).collect();
        lines.push(format!(
            "guild {}: role {}, /{}, {} available, {} redeemed by {} members{}",
            community.community_id,
            community.role_id,
            community.command,
            community.keys.len(),
            community.claims.len(),
            claimants.len(),
            if community.one_per_member { ", one per member" } else { "" }
        ));
    }
    lines.join("\n")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate { count, out } => {
            let keys = generate_keys(count).join("\n");
            match out {
                Some(path) => {
                    std::fs::write(&path, format!("{}\n", keys))?;
                    eprintln!("Wrote {} keys to {}", count, path.display());
                }
                None => writeln!(std::io::stdout(), "{}", keys)?,
            }
        }
        Commands::Inspect { backend, path, json } => {
            let store = open(backend, &path).await?;
            let snapshot = store.load().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{}", summarize(&snapshot));
            }
        }
    }

    Ok(())
}
