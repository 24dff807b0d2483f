//! Aurora Migration Command-Line Host
//!
//! Inspects, plans and runs schema migrations for the modules declared in
//! manifest files against a local data directory.

mod commands;
mod formatter;

use aurora_migrate_core::migration::MigrationConfig;
use clap::{Parser, Subcommand};
use commands::Context;
use formatter::OutputFormat;
use std::path::PathBuf;
use std::time::Duration;

/// Aurora Migration Command-Line Host
#[derive(Parser, Debug)]
#[command(name = "aurora-migrate")]
#[command(version, about = "Aurora schema migration host")]
pub struct Args {
    /// Data directory of the store
    #[arg(short = 'd', long, default_value = "aurora-data")]
    pub data_dir: PathBuf,

    /// Migrator manifest (repeatable)
    #[arg(short = 'm', long = "manifest")]
    pub manifests: Vec<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Skip table validation after each step
    #[arg(long)]
    pub no_validate: bool,

    /// Seconds to wait for a module lock
    #[arg(long, default_value_t = 30)]
    pub lock_timeout: u64,

    /// Abort a migration after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Lock owner recorded while migrating
    #[arg(long)]
    pub owner: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show persisted and latest version of every module
    Status,
    /// Show the operation each module would execute
    Plan {
        /// Only this module
        module: Option<String>,
    },
    /// Migrate modules to their latest version
    Migrate {
        /// Only this module
        module: Option<String>,
    },
    /// Release a module lock left behind by a crashed host
    Unlock {
        /// Module name
        module: String,
    },
}

impl Args {
    fn migration_config(&self) -> MigrationConfig {
        let mut config = MigrationConfig::default()
            .with_validation(!self.no_validate)
            .with_lock_timeout(Duration::from_secs(self.lock_timeout));
        if let Some(secs) = self.timeout {
            config = config.with_operation_timeout(Duration::from_secs(secs));
        }
        if let Some(owner) = &self.owner {
            config = config.with_lock_owner(owner.clone());
        }
        config
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("aurora_migrate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open(&args.data_dir, &args.manifests, args.migration_config())?;
    let formatter = formatter::create_formatter(args.format);

    match &args.command {
        Command::Status => println!("{}", formatter.format_status(&ctx.status()?)),
        Command::Plan { module } => {
            println!("{}", formatter.format_plans(&ctx.plan(module.as_deref())?))
        }
        Command::Migrate { module } => {
            let outcome = ctx.migrate(module.as_deref());
            for report in &outcome.reports {
                println!("{}", formatter.format_report(report));
            }
            if let Some(e) = outcome.error {
                return Err(e.into());
            }
        }
        Command::Unlock { module } => {
            let message = match ctx.unlock(module)? {
                Some(holder) => format!("Released lock on {} held by {}", module, holder),
                None => format!("{} was not locked", module),
            };
            println!("{}", formatter.format_message(&message));
        }
    }
    Ok(())
}
