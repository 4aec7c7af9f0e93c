//! CLI command implementations.

pub mod ring;
pub mod schema;
pub mod security;
pub mod webhook;

use anyhow::Result;
use serde::Serialize;

/// Prints a value as indented JSON, the output format of every command.
pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
