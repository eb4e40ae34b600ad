//! mintdb launcher: creates or opens a database and closes it cleanly.

use anyhow::{bail, Context, Result};
use clap::Parser as ClapParser;
use log::info;
use std::path::PathBuf;

use mintdb::config::{parse_mem, DatabaseConfig};
use mintdb::Database;

/// mintdb - an embeddable transactional storage kernel
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Create a new database at this base path
    #[arg(long, conflicts_with = "open")]
    create: Option<PathBuf>,

    /// Open an existing database at this base path, recovering it if needed
    #[arg(long)]
    open: Option<PathBuf>,

    /// Page cache memory quota (KB, MB or GB suffix)
    #[arg(long, default_value = "64MB")]
    mem: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let mem = parse_mem(&args.mem).context("Invalid --mem value")?;

    match (args.create, args.open) {
        (Some(path), _) => {
            let config = DatabaseConfig::new(&path).with_mem(mem);
            let db = Database::create(config)
                .with_context(|| format!("Failed to create database at {}", path.display()))?;
            db.close().context("Failed to close database")?;
            println!("Created database at {}", path.display());
        }
        (None, Some(path)) => {
            let config = DatabaseConfig::new(&path).with_mem(mem);
            let db = Database::open(config)
                .with_context(|| format!("Failed to open database at {}", path.display()))?;

            let tm = db.transaction_manager();
            info!("Database has {} pages", db.data_manager().page_count());
            println!("Database: {}", path.display());
            println!("  pages:        {}", db.data_manager().page_count());
            println!("  transactions: {}", tm.xid_count());

            db.close().context("Failed to close database")?;
        }
        (None, None) => bail!("Nothing to do: pass --create PATH or --open PATH"),
    }

    Ok(())
}
