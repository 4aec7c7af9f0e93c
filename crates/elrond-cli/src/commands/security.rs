//! `elrond security` commands.

use anyhow::Result;
use clap::Subcommand;

use crate::client::Client;

#[derive(Subcommand, Debug)]
pub enum SecurityCommands {
    /// Lock API changes for a ring
    Lock {
        /// The id of the ring
        #[arg(long)]
        ring: String,
    },

    /// Unlock API changes for a ring
    Unlock {
        /// The id of the ring
        #[arg(long)]
        ring: String,
    },
}

pub fn run(server: &str, command: SecurityCommands) -> Result<()> {
    let client = Client::new(server)?;

    match command {
        SecurityCommands::Lock { ring } => client.lock_ring_api(&ring),
        SecurityCommands::Unlock { ring } => client.unlock_ring_api(&ring),
    }
}
