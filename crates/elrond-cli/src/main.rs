//! elrond: operator CLI for the elrond ring release server.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod client;
mod commands;

use commands::{ring, schema, security, webhook};

const DEFAULT_LOCAL_SERVER_API: &str = "http://localhost:3018";

/// elrond - manage progressive ring-based releases
#[derive(Parser, Debug)]
#[command(name = "elrond")]
#[command(version, about, long_about = None)]
struct Cli {
    /// The elrond server whose API will be queried
    #[arg(long, global = true, default_value = DEFAULT_LOCAL_SERVER_API)]
    server: String,

    /// Only print the API request without sending it
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manipulate rings managed by the elrond server
    #[command(subcommand)]
    Ring(ring::RingCommands),

    /// Manipulate webhooks managed by the elrond server
    #[command(subcommand)]
    Webhook(webhook::WebhookCommands),

    /// Manage security locks for rings
    #[command(subcommand)]
    Security(security::SecurityCommands),

    /// Inspect and migrate the database schema
    #[command(subcommand)]
    Schema(schema::SchemaCommands),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ring(command) => ring::run(&cli.server, cli.dry_run, command),
        Commands::Webhook(command) => webhook::run(&cli.server, cli.dry_run, command),
        Commands::Security(command) => security::run(&cli.server, command),
        Commands::Schema(command) => schema::run(command),
    }
}
