//! Subcommand definitions.

use clap::{Args, Subcommand, ValueEnum};

/// Transport the `serve` command binds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ServeMode {
    /// Speak MCP over stdio (for use as a child process).
    #[default]
    Stdio,
    /// Serve MCP over HTTP.
    Http,
    /// Both at once.
    Hybrid,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the aggregator
    Serve {
        /// Transport to serve on
        #[arg(long = "mode", value_enum, default_value_t = ServeMode::Stdio)]
        mode: ServeMode,

        /// Shorthand for --mode http
        #[arg(long, conflicts_with_all = ["stdio", "hybrid"])]
        http: bool,

        /// Shorthand for --mode stdio
        #[arg(long, conflicts_with_all = ["http", "hybrid"])]
        stdio: bool,

        /// Shorthand for --mode hybrid
        #[arg(long, conflicts_with_all = ["http", "stdio"])]
        hybrid: bool,

        /// Port for the HTTP transport
        #[arg(long, default_value_t = 8000)]
        port: u16,

        /// Host for the HTTP transport
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Manage bearer-token authentication
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },

    /// Show catalog and runtime status
    Status,

    /// List configured servers
    ListServers,

    /// Add a server to the catalog
    AddServer(AddServerArgs),

    /// Remove a server from the catalog
    RemoveServer {
        /// Server name
        name: String,
    },
}

#[derive(Subcommand)]
pub enum AuthCommand {
    /// Generate an RSA keypair
    Init,
    /// Issue a bearer token
    Token {
        /// Token subject
        #[arg(long, default_value = "dev-user")]
        subject: String,
        /// Validity in hours
        #[arg(long, default_value_t = 24)]
        hours: i64,
        /// Scopes to embed (informational)
        #[arg(long)]
        scope: Vec<String>,
    },
    /// Report whether auth is enabled
    Status,
    /// Print the public key PEM
    PublicKey,
    /// Print the private key PEM
    PrivateKey,
}

#[derive(Args)]
pub struct AddServerArgs {
    /// Unique server name
    pub name: String,

    /// Executable for a stdio server
    #[arg(long, conflicts_with = "uri")]
    pub command: Option<String>,

    /// Arguments for the executable
    #[arg(long = "arg")]
    pub args: Vec<String>,

    /// Endpoint for an HTTP server
    #[arg(long)]
    pub uri: Option<String>,

    /// Capability prefix (defaults to one derived from the name)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Working directory (absolute)
    #[arg(long)]
    pub cwd: Option<String>,

    /// KEY=VALUE environment entries
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// Free-form notes
    #[arg(long)]
    pub notes: Option<String>,

    /// Add disabled
    #[arg(long)]
    pub disabled: bool,
}

impl Commands {
    /// Resolve the serve mode from `--mode` and its shorthand flags.
    #[must_use]
    pub fn effective_serve_mode(mode: ServeMode, http: bool, stdio: bool, hybrid: bool) -> ServeMode {
        if http {
            ServeMode::Http
        } else if stdio {
            ServeMode::Stdio
        } else if hybrid {
            ServeMode::Hybrid
        } else {
            mode
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_flags_win() {
        assert_eq!(
            Commands::effective_serve_mode(ServeMode::Stdio, true, false, false),
            ServeMode::Http
        );
        assert_eq!(
            Commands::effective_serve_mode(ServeMode::Http, false, false, true),
            ServeMode::Hybrid
        );
        assert_eq!(
            Commands::effective_serve_mode(ServeMode::Http, false, false, false),
            ServeMode::Http
        );
    }
}
