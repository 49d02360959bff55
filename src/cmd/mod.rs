//! CLI command handlers.

use clap::Subcommand;

mod collaborators;
pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Check connectivity to the container daemon and the database, and
    /// print the resolved configuration.
    Diagnostics,
}
