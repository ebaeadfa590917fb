//! CLI front-end for the magg aggregator.

pub mod commands;
pub mod handlers;
pub mod parser;

pub use commands::{AddServerArgs, AuthCommand, Commands, ServeMode};
pub use parser::Cli;
