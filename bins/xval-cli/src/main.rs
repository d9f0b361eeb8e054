mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xval-cli")]
#[command(about = "xval CLI - Scaffold grading layouts, prepare sources, and inspect results", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a grading layout with a default config/grader.json
    Init {
        /// Root directory of the layout
        #[arg(short, long, default_value = ".")]
        path: String,
    },

    /// Strip comments from a source file the way staging does
    StripComments {
        /// File to rewrite
        file: PathBuf,

        /// Write here instead of rewriting in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the results found in a results directory
    Report {
        /// Results directory
        #[arg(short, long, default_value = "/autograder/results")]
        results: PathBuf,

        /// Print the rows as JSON instead of a table
        #[arg(long, default_value = "false")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            commands::init_project(&path).await?;
        }
        Commands::StripComments { file, output } => {
            commands::strip_file(&file, output.as_deref()).await?;
        }
        Commands::Report { results, json } => {
            commands::print_report(&results, json).await?;
        }
    }

    Ok(())
}
