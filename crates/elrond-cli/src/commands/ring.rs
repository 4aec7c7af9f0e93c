//! `elrond ring` commands.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use clap::Subcommand;

use elrond_core::model::{
    CreateRingRequest, RegisterInstallationGroupRequest, RingReleaseRequest, UpdateRingRequest,
};

use crate::client::Client;

use super::print_json;

#[derive(Subcommand, Debug)]
pub enum RingCommands {
    /// Create a ring
    Create {
        /// The name that identifies the deployment ring
        #[arg(long, default_value = "")]
        name: String,

        /// The priority of the new deployment ring (lower is released first)
        #[arg(long, default_value_t = 1)]
        priority: i64,

        /// The soak time in seconds to consider a ring release stable
        #[arg(long, default_value_t = 7200)]
        soak_time: i64,

        /// The image to associate with this release ring
        #[arg(long, default_value = "")]
        image: String,

        /// The version to associate with this release ring
        #[arg(long, default_value = "")]
        version: String,

        /// The installation group name to register with the ring
        #[arg(long, default_value = "")]
        installation_group_name: String,

        /// The installation group soak time
        #[arg(long, default_value_t = 0)]
        installation_group_soak_time: i64,

        /// The installation group provisioner group ID to associate
        #[arg(long, default_value = "")]
        installation_group_provisioner_group_id: String,
    },

    /// Retry a failed ring creation
    Retry {
        /// The id of the ring to retry
        #[arg(long)]
        ring: String,
    },

    /// Update a ring
    Update {
        /// The id of the ring to update
        #[arg(long)]
        ring: String,

        /// The name to set on the deployment ring
        #[arg(long)]
        name: Option<String>,

        /// The priority to set on the deployment ring
        #[arg(long)]
        priority: Option<i64>,

        /// The soak time to set on the deployment ring
        #[arg(long)]
        soak_time: Option<i64>,
    },

    /// Release a ring, or all rings
    Release {
        /// The id of the ring to be released (ignored with --all-rings)
        #[arg(long, default_value = "")]
        ring: String,

        /// The image to release to
        #[arg(long, default_value = "")]
        image: String,

        /// The version to release to
        #[arg(long, default_value = "")]
        version: String,

        /// Force the release, ignoring soak times and admission gates
        #[arg(long)]
        force: bool,

        /// Release all rings
        #[arg(long)]
        all_rings: bool,

        /// Pause all pending releases
        #[arg(long)]
        pause: bool,

        /// Resume all paused releases
        #[arg(long)]
        resume: bool,

        /// Cancel all pending releases
        #[arg(long)]
        cancel: bool,

        /// Additional env variables for the release, e.g. --env-variable KEY=VALUE
        #[arg(long = "env-variable")]
        env_variables: Vec<String>,
    },

    /// Get a release by id
    GetRelease {
        /// The id of the release to return
        #[arg(long)]
        release: String,
    },

    /// Delete a ring
    Delete {
        /// The id of the ring to be deleted
        #[arg(long)]
        ring: String,
    },

    /// Get a ring by id
    Get {
        /// The id of the ring to be fetched
        #[arg(long)]
        ring: String,
    },

    /// List rings
    List {
        /// The page of rings to fetch, starting at 0
        #[arg(long, default_value_t = 0)]
        page: i64,

        /// The number of rings to fetch per page
        #[arg(long, default_value_t = 100)]
        per_page: i64,

        /// Whether to include deleted rings
        #[arg(long)]
        include_deleted: bool,

        /// Display the ring list as a table instead of JSON
        #[arg(long)]
        table: bool,
    },

    /// Manage a ring's installation groups
    #[command(subcommand)]
    Installationgroup(InstallationGroupCommands),
}

#[derive(Subcommand, Debug)]
pub enum InstallationGroupCommands {
    /// Register an installation group with a ring
    Register {
        /// The id of the ring
        #[arg(long)]
        ring: String,

        /// The installation group name
        #[arg(long)]
        name: String,

        /// The installation group soak time
        #[arg(long, default_value_t = 0)]
        soak_time: i64,

        /// The provisioner group ID to associate
        #[arg(long, default_value = "")]
        provisioner_group_id: String,
    },

    /// Remove an installation group from a ring
    Delete {
        /// The id of the ring
        #[arg(long)]
        ring: String,

        /// The id of the installation group
        #[arg(long)]
        installation_group: String,
    },
}

fn render_ring_table(rings: &[elrond_core::model::Ring]) -> String {
    #[derive(tabled::Tabled)]
    #[tabled(rename_all = "UPPERCASE")]
    struct RingRow<'a> {
        id: &'a str,
        name: &'a str,
        priority: i64,
        state: String,
        #[tabled(rename = "SOAK TIME")]
        soak_time: i64,
        groups: usize,
    }

    let rows = rings.iter().map(|ring| RingRow {
        id: &ring.id,
        name: &ring.name,
        priority: ring.priority,
        state: ring.state.to_string(),
        soak_time: ring.soak_time,
        groups: ring.installation_groups.len(),
    });

    tabled::Table::new(rows)
        .with(tabled::settings::Style::empty())
        .with(tabled::settings::Padding::new(0, 2, 0, 0))
        .to_string()
}

fn parse_env_variables(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("invalid env variable {entry:?}, expected KEY=VALUE"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

pub fn run(server: &str, dry_run: bool, command: RingCommands) -> Result<()> {
    let client = Client::new(server)?;

    match command {
        RingCommands::Create {
            name,
            priority,
            soak_time,
            image,
            version,
            installation_group_name,
            installation_group_soak_time,
            installation_group_provisioner_group_id,
        } => {
            let installation_group = (!installation_group_name.is_empty()).then(|| {
                RegisterInstallationGroupRequest {
                    name: installation_group_name,
                    soak_time: installation_group_soak_time,
                    provisioner_group_id: installation_group_provisioner_group_id,
                }
            });
            let request = CreateRingRequest {
                name,
                priority,
                installation_group,
                soak_time,
                image,
                version,
                api_security_lock: false,
            };
            if dry_run {
                return print_json(&request);
            }
            let ring = client
                .create_ring(&request)
                .with_context(|| format!("failed to create ring {}", request.name))?;
            print_json(&ring)
        }

        RingCommands::Retry { ring } => {
            let ring = client.retry_create_ring(&ring)?;
            print_json(&ring)
        }

        RingCommands::Update {
            ring,
            name,
            priority,
            soak_time,
        } => {
            let request = UpdateRingRequest {
                name,
                priority,
                soak_time,
            };
            if dry_run {
                return print_json(&request);
            }
            let ring = client.update_ring(&ring, &request)?;
            print_json(&ring)
        }

        RingCommands::Release {
            ring,
            image,
            version,
            force,
            all_rings,
            pause,
            resume,
            cancel,
            env_variables,
        } => {
            if pause {
                return client.pause_release();
            }
            if resume {
                return client.resume_release();
            }
            if cancel {
                return client.cancel_release();
            }

            let request = RingReleaseRequest {
                image,
                version,
                force,
                env_variables: parse_env_variables(&env_variables)?,
                readiness_probe: None,
                liveness_probe: None,
            };
            if dry_run {
                return print_json(&request);
            }

            if all_rings {
                let rings = client.release_all_rings(&request)?;
                return print_json(&rings);
            }
            if ring.is_empty() {
                bail!("either --ring or --all-rings is required");
            }
            let ring = client.release_ring(&ring, &request)?;
            print_json(&ring)
        }

        RingCommands::GetRelease { release } => {
            let release = client.get_release(&release)?;
            print_json(&release)
        }

        RingCommands::Delete { ring } => client.delete_ring(&ring),

        RingCommands::Get { ring } => {
            let ring = client.get_ring(&ring)?;
            print_json(&ring)
        }

        RingCommands::List {
            page,
            per_page,
            include_deleted,
            table,
        } => {
            let rings = client.get_rings(page, per_page, include_deleted)?;
            if table {
                println!("{}", render_ring_table(&rings));
                return Ok(());
            }
            print_json(&rings)
        }

        RingCommands::Installationgroup(command) => match command {
            InstallationGroupCommands::Register {
                ring,
                name,
                soak_time,
                provisioner_group_id,
            } => {
                let request = RegisterInstallationGroupRequest {
                    name,
                    soak_time,
                    provisioner_group_id,
                };
                if dry_run {
                    return print_json(&request);
                }
                let ring = client.register_installation_group(&ring, &request)?;
                print_json(&ring)
            }
            InstallationGroupCommands::Delete {
                ring,
                installation_group,
            } => client.delete_installation_group(&ring, &installation_group),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_table_renders_one_row_per_ring() {
        use elrond_core::model::{Ring, RingState, PROVISIONER_NAME};

        let ring = Ring {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            name: "ring-0".to_string(),
            priority: 1,
            soak_time: 7200,
            state: RingState::Stable,
            provisioner: PROVISIONER_NAME.to_string(),
            active_release_id: String::new(),
            desired_release_id: String::new(),
            create_at: 0,
            delete_at: 0,
            release_at: 0,
            api_security_lock: false,
            lock_acquired_by: None,
            lock_acquired_at: 0,
            installation_groups: Vec::new(),
        };

        let table = render_ring_table(std::slice::from_ref(&ring));
        assert!(table.contains("01ARZ3NDEKTSV4RRFFQ69G5FAV"));
        assert!(table.contains("stable"));
        assert!(table.contains("NAME"));
    }

    #[test]
    fn env_variables_parse_key_value_pairs() {
        let env = parse_env_variables(&["A=1".to_string(), "B=two=2".to_string()]).unwrap();
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("two=2"));

        assert!(parse_env_variables(&["missing-separator".to_string()]).is_err());
    }
}
