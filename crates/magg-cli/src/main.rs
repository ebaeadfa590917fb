//! CLI entry point — the composition root.
//!
//! Settings come from `MAGG_*` environment variables with command-line
//! overrides on top; dispatch routes to handlers. Exit codes: 0 success,
//! 1 error, 130 interrupt (set inside the serve handler).

use clap::Parser;

use magg_cli::{handlers, Cli, Commands};
use magg_core::Settings;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("MAGG_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::from_env();
    if let Some(config) = cli.config {
        settings.config_path = config;
    }
    if let Err(e) = settings.validate() {
        eprintln!("error: {e}");
        return std::process::ExitCode::FAILURE;
    }

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        let _ = Cli::command().print_help();
        return std::process::ExitCode::SUCCESS;
    };

    let result = match command {
        Commands::Serve {
            mode,
            http,
            stdio,
            hybrid,
            port,
            host,
        } => {
            let mode = Commands::effective_serve_mode(mode, http, stdio, hybrid);
            handlers::serve::execute(settings, mode, &host, port).await
        }
        Commands::Auth { command } => handlers::auth::execute(&settings, &command),
        Commands::Status => handlers::status::execute(&settings),
        Commands::ListServers => handlers::servers::list(&settings),
        Commands::AddServer(args) => handlers::servers::add(&settings, &args),
        Commands::RemoveServer { name } => handlers::servers::remove(&settings, &name),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
