//! `elrond webhook` commands.

use anyhow::Result;
use clap::Subcommand;

use elrond_core::model::CreateWebhookRequest;

use crate::client::Client;

use super::print_json;

#[derive(Subcommand, Debug)]
pub enum WebhookCommands {
    /// Register a webhook
    Create {
        /// An identifier for the owner of the webhook
        #[arg(long)]
        owner: String,

        /// The URL payloads will be POSTed to
        #[arg(long)]
        url: String,
    },

    /// Get a webhook by id
    Get {
        /// The id of the webhook
        #[arg(long)]
        webhook: String,
    },

    /// List webhooks
    List {
        /// The page of webhooks to fetch, starting at 0
        #[arg(long, default_value_t = 0)]
        page: i64,

        /// The number of webhooks to fetch per page
        #[arg(long, default_value_t = 100)]
        per_page: i64,
    },

    /// Delete a webhook
    Delete {
        /// The id of the webhook
        #[arg(long)]
        webhook: String,
    },
}

pub fn run(server: &str, dry_run: bool, command: WebhookCommands) -> Result<()> {
    let client = Client::new(server)?;

    match command {
        WebhookCommands::Create { owner, url } => {
            let request = CreateWebhookRequest {
                owner_id: owner,
                url,
            };
            if dry_run {
                return print_json(&request);
            }
            let webhook = client.create_webhook(&request)?;
            print_json(&webhook)
        }

        WebhookCommands::Get { webhook } => {
            let webhook = client.get_webhook(&webhook)?;
            print_json(&webhook)
        }

        WebhookCommands::List { page, per_page } => {
            let webhooks = client.get_webhooks(page, per_page)?;
            print_json(&webhooks)
        }

        WebhookCommands::Delete { webhook } => client.delete_webhook(&webhook),
    }
}
