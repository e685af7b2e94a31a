//! tidyrun CLI - Main Entry Point
//!
//! Runs test, workflow and pipeline definitions and manages cleanups
//! that could not finish during a run.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tidyrun_cli::commands::{cleanup, run};
use tidyrun_cli::output::{print_error, OutputFormat};
use tidyrun_cli::EXIT_FATAL;
use tidyrun_common::GlobalConfig;

/// tidyrun - end-to-end tests that clean up after themselves
#[derive(Parser)]
#[command(name = "tidyrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (defaults to ./tidyrun.toml)
    #[arg(long, env = "TIDYRUN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory for session markers and failed cleanup records
    #[arg(long, env = "TIDYRUN_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test, workflow or pipeline
    Run(run::RunArgs),

    /// Inspect and retry failed cleanups
    #[command(subcommand)]
    Cleanup(cleanup::CleanupCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            print_error(&format!("{:#}", e));
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let cwd = std::env::current_dir()?;
    let mut config = match &cli.config {
        Some(path) => GlobalConfig::load(path)?,
        None => GlobalConfig::discover(&cwd)?,
    };
    if let Some(dir) = cli.state_dir {
        config.run.state_dir = Some(dir);
    }

    match cli.command {
        Commands::Run(args) => run::execute(args, config, cwd, cli.format).await,
        Commands::Cleanup(cmd) => cleanup::execute(cmd, config, cwd, cli.format).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_repeated_viewports() {
        let cli = Cli::try_parse_from([
            "tidyrun",
            "run",
            "flow.yaml",
            "--viewport",
            "1280x720",
            "--viewport",
            "375x667",
            "--driver",
            "node driver.js",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.viewports.len(), 2);
                assert_eq!(args.viewports[1].width, 375);
                assert_eq!(args.driver.as_deref(), Some("node driver.js"));
            }
            Commands::Cleanup(_) => panic!("expected run"),
        }
    }

    #[test]
    fn parses_cleanup_retry_without_session() {
        let cli = Cli::try_parse_from(["tidyrun", "cleanup", "retry"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cleanup(cleanup::CleanupCommands::Retry { session: None })
        ));
    }
}
