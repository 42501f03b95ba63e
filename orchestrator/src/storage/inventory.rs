//! Machine inventory file
//!
//! Machines are registered elsewhere; the orchestrator reads their
//! connection coordinates from `machines.json` at startup.

use std::collections::BTreeSet;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::filesys::file::File;
use crate::models::machine::{Machine, MachineAuth, MachineId};

/// One machine as written in the inventory file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineEntry {
    pub id: MachineId,

    pub name: String,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_username")]
    pub username: String,

    /// Password login through sshpass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Local path of a private key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

impl MachineEntry {
    async fn into_machine(self) -> Result<Machine, OrchestratorError> {
        let auth = match (self.password, self.private_key_file) {
            (Some(_), Some(_)) => {
                return Err(OrchestratorError::ConfigError(format!(
                    "machine {} sets both a password and a private key",
                    self.id
                )))
            }
            (Some(password), None) => MachineAuth::Password(SecretString::from(password)),
            (None, Some(path)) => {
                let key = File::new(&path).read_string().await.map_err(|e| {
                    OrchestratorError::ConfigError(format!(
                        "machine {}: cannot read private key {}: {}",
                        self.id, path, e
                    ))
                })?;
                MachineAuth::PrivateKey(SecretString::from(key))
            }
            (None, None) => MachineAuth::Agent,
        };

        Ok(Machine::new(self.id, self.name, self.host)
            .with_port(self.port)
            .with_user(self.username)
            .with_auth(auth))
    }
}

/// Load every machine from the inventory file. A missing file is an empty
/// inventory.
pub async fn load_inventory(file: &File) -> Result<Vec<Machine>, OrchestratorError> {
    if !file.exists().await {
        return Ok(Vec::new());
    }
    let entries: Vec<MachineEntry> = file.read_json().await?;

    let mut seen = BTreeSet::new();
    let mut machines = Vec::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.id) {
            return Err(OrchestratorError::ConfigError(format!(
                "machine {} appears more than once in the inventory",
                entry.id
            )));
        }
        if entry.host.trim().is_empty() {
            return Err(OrchestratorError::ConfigError(format!(
                "machine {} has no host",
                entry.id
            )));
        }
        machines.push(entry.into_machine().await?);
    }
    Ok(machines)
}
