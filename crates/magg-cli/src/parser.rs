//! Top-level CLI parser with global options.

use std::path::PathBuf;

use clap::Parser;

use crate::commands::Commands;

/// Command-line interface for the magg MCP aggregator.
#[derive(Parser)]
#[command(name = "magg")]
#[command(about = "Aggregate many MCP servers behind one endpoint")]
#[command(version)]
pub struct Cli {
    /// Override the catalog path for this invocation
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn parser_builds() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_args_parse() {
        let cli = Cli::parse_from(["magg", "--verbose", "--config", "/tmp/c.json", "status"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
    }
}
