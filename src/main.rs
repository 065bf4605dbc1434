//! rstm - concurrent finite-state-machine engine
//!
//! Runs the built-in demo machines, renders their diagrams and prints the
//! effective settings.

mod demos;
mod settings;

use clap::{Parser, Subcommand};
use colored::Colorize;
use demos::{DemoKind, DiagramFormat};
use settings::Settings;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstm")]
#[command(about = "Concurrent finite-state-machine engine")]
#[command(version)]
struct Cli {
    /// Settings file (YAML)
    #[arg(short, long, env = "RSTM_CONFIG")]
    config: Option<PathBuf>,

    /// Log engine internals at debug level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo machine
    Demo {
        /// Demo to run
        #[arg(value_enum)]
        name: DemoKind,
    },

    /// Print a demo machine's state diagram (Mermaid)
    Diagram {
        /// Demo to render
        #[arg(value_enum)]
        name: DemoKind,

        /// Wrap the diagram in a standalone HTML page
        #[arg(long, conflicts_with = "json")]
        html: bool,

        /// Print the graph description as JSON instead
        #[arg(long)]
        json: bool,
    },

    /// Print the effective settings as YAML
    Config,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            return Err(e.into());
        }
    };
    tracing::debug!("worker thread name: {}", settings.engine.worker_name);

    match cli.command {
        Commands::Demo { name } => {
            if let Err(e) = name.run(&settings) {
                eprintln!("{}: {}", "Demo failed".red(), e);
                return Err(e);
            }
        }
        Commands::Diagram { name, html, json } => {
            let format = if html {
                DiagramFormat::Html
            } else if json {
                DiagramFormat::Json
            } else {
                DiagramFormat::Mermaid
            };
            println!("{}", name.diagram(format)?);
        }
        Commands::Config => {
            print!("{}", settings.to_yaml()?);
        }
    }

    Ok(())
}
