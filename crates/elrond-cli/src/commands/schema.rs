//! `elrond schema` commands.
//!
//! These operate on the database directly rather than through the
//! server API.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use elrond_core::store::Store;

#[derive(Subcommand, Debug)]
pub enum SchemaCommands {
    /// Print the schema version of a database
    Version {
        /// The database to inspect
        #[arg(long, default_value = "elrond.db")]
        database: PathBuf,
    },

    /// Migrate a database to the latest schema version
    Migrate {
        /// The database to migrate
        #[arg(long, default_value = "elrond.db")]
        database: PathBuf,
    },
}

pub fn run(command: SchemaCommands) -> Result<()> {
    match command {
        SchemaCommands::Version { database } => {
            let store = Store::open_existing(&database)
                .with_context(|| format!("failed to open database {}", database.display()))?;
            println!("current: {}", store.current_version()?);
            println!("latest:  {}", Store::latest_version());
            Ok(())
        }

        SchemaCommands::Migrate { database } => {
            let store = Store::open_existing(&database)
                .with_context(|| format!("failed to open database {}", database.display()))?;
            let version = store.migrate()?;
            println!("migrated to {version}");
            Ok(())
        }
    }
}
