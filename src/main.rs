use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skillpanel::{
    Actor, Config, Database, ErrorKind, Ledger, LocalKeyring, ReviewService, StaticCatalogs,
    SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Operator tooling for the skill review panel database.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the database path from the config
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the ledger hash chain from the tail back to genesis
    VerifyLedger,
    /// Print one assessment and, if generated, its discussion result
    Show {
        /// Assessment id
        assessment_id: String,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skillpanel=info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;
    if let Some(db) = cli.database {
        config.database_path = db;
    }

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::VerifyLedger => verify_ledger(&config),
        Commands::Show { assessment_id } => show(&config, &assessment_id),
    }
}

fn open(config: &Config) -> Result<(Arc<Database>, Arc<Ledger>)> {
    let db = Arc::new(Database::open(&config.database_path)?);
    // Signature checks need only the stored public keys; no data key is read.
    let ledger = Arc::new(Ledger::new(
        db.clone(),
        Arc::new(LocalKeyring::generate()),
        Arc::new(SystemClock),
        config.ledger.clone(),
    ));
    Ok((db, ledger))
}

fn verify_ledger(config: &Config) -> Result<()> {
    let (_db, ledger) = open(config)?;
    let report = ledger.verify_chain().context("Ledger verification failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn show(config: &Config, assessment_id: &str) -> Result<()> {
    let (db, ledger) = open(config)?;
    let service = ReviewService::new(
        db,
        ledger,
        Arc::new(StaticCatalogs::new()),
        config.review.clone(),
    );

    let operator = Actor::admin("skillpanel-cli");
    let assessment = service.get(&operator, assessment_id)?;
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    match service.discussion(&operator, assessment_id) {
        Ok(view) => println!("{}", serde_json::to_string_pretty(&view)?),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
