//! Foreman CLI tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Foreman build distributor", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(
        long,
        global = true,
        env = "FOREMAN_CONFIG",
        default_value = "foreman.kdl"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration
    Validate,
    /// List configured projects
    Projects,
    /// Build a project and wait for the result
    Run {
        /// Project name
        project: String,
        /// Build this scm revision instead of the configured one
        #[arg(long)]
        rev: Option<String>,
        /// Append build records to this journal file
        #[arg(long, env = "FOREMAN_JOURNAL")]
        journal: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate => {
            commands::validate(&cli.config)?;
        }
        Commands::Projects => {
            commands::projects(&cli.config)?;
        }
        Commands::Run {
            project,
            rev,
            journal,
        } => {
            commands::run::run(&cli.config, &project, rev, journal).await?;
        }
    }

    Ok(())
}
