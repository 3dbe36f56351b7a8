//! Eco CLI - load, inspect and run namespaced modules

#![warn(missing_docs)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

mod commands;
mod config;
mod runner;

use commands::{data, tree, use_modules};

#[derive(Parser)]
#[command(name = "eco")]
#[command(about = "Lazy module and namespace runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ./eco.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory served to the runtime
    #[arg(long, global = true, env = "ECO_ROOT")]
    root: Option<PathBuf>,

    /// Load modules over HTTP from this base URL instead of a directory
    #[arg(long, global = true, env = "ECO_REMOTE")]
    remote: Option<String>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and execute modules, printing their exports
    Use {
        /// Namespaces to load first
        #[arg(short = 'n', long = "namespace")]
        namespaces: Vec<String>,

        /// Module ids (`id` or `namespace.id`)
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Print the namespace tree
    Tree {
        /// Namespaces to load first
        #[arg(short = 'n', long = "namespace")]
        namespaces: Vec<String>,

        /// Include the module dependency tree of every namespace
        #[arg(long)]
        modules: bool,
    },

    /// Read namespace data
    Data {
        /// `key` or `key.env`
        selector: String,

        /// Namespace to read from (defaults to the root)
        #[arg(short = 'n', long = "namespace")]
        namespace: Option<String>,

        /// Activate this environment before reading
        #[arg(long)]
        env: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration, flags win over the file
    let mut config = config::load_config(cli.config)?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(remote) = cli.remote {
        config.remote = Some(remote);
    }

    let runtime = runner::start(&config).await?;

    match cli.command {
        Commands::Use { namespaces, ids } => {
            use_modules::use_modules(&runtime, &namespaces, &ids).await?;
        }
        Commands::Tree {
            namespaces,
            modules,
        } => {
            tree::tree(&runtime, &namespaces, modules).await?;
        }
        Commands::Data {
            selector,
            namespace,
            env,
        } => {
            data::data(&runtime, namespace.as_deref(), &selector, env.as_deref()).await?;
        }
    }

    Ok(())
}
