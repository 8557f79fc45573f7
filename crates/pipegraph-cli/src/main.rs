//! pipegraph CLI tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pipegraph")]
#[command(about = "Resolve, validate and run CI pipeline declarations", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, global = true, env = "PIPEGRAPH_CONFIG")]
    system_config: Option<PathBuf>,

    /// Global parameter override, may be repeated
    #[arg(long = "param", global = true, value_name = "KEY=VALUE")]
    params: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a settings directory and report every problem
    Validate {
        /// Directory containing .kdl declarations
        dir: PathBuf,
    },
    /// Print the resolved graph as JSON
    Resolve {
        /// Directory containing .kdl declarations
        dir: PathBuf,
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// Single-line JSON
        #[arg(long)]
        compact: bool,
    },
    /// List projects and build types
    List {
        /// Directory containing .kdl declarations
        dir: PathBuf,
    },
    /// Run the steps of a build type locally
    Run {
        /// Directory containing .kdl declarations
        dir: PathBuf,
        /// Build type id
        build_type: String,
        /// Directory steps run in
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so resolved output can be piped.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = commands::GlobalOptions {
        system_config: cli.system_config,
        params: cli.params,
    };

    match cli.command {
        Commands::Validate { dir } => {
            commands::validate(&options, &dir)?;
        }
        Commands::Resolve {
            dir,
            output,
            compact,
        } => {
            commands::resolve(&options, &dir, output.as_deref(), compact)?;
        }
        Commands::List { dir } => {
            commands::list(&options, &dir)?;
        }
        Commands::Run {
            dir,
            build_type,
            working_dir,
        } => {
            commands::run::run_local(&options, &dir, &build_type, working_dir).await?;
        }
    }

    Ok(())
}
