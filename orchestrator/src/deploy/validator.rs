//! Pre-flight connection checks

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::OrchestratorError;
use crate::models::machine::{Machine, MachineId};
use crate::remote::host::RemoteHost;
use crate::store::{not_found, MachineStore};

/// Confirms a machine answers before an operation commits to it
pub struct ConnectionValidator {
    machines: Arc<dyn MachineStore>,
    host: Arc<dyn RemoteHost>,
}

impl ConnectionValidator {
    pub fn new(machines: Arc<dyn MachineStore>, host: Arc<dyn RemoteHost>) -> Self {
        Self { machines, host }
    }

    pub async fn validate(&self, machine: Option<&Machine>) -> Result<(), OrchestratorError> {
        let Some(machine) = machine else {
            return Err(OrchestratorError::ValidationError(
                "machine must be given".to_string(),
            ));
        };

        match self.host.ping(machine).await {
            Ok(true) => {
                debug!(machine_id = machine.id, "connection ok");
                Ok(())
            }
            Ok(false) => Err(OrchestratorError::ConnectionFailed(format!(
                "cannot reach {} at {}",
                machine.name,
                machine.address()
            ))),
            Err(e) if e.is_environment() => Err(OrchestratorError::EnvironmentError(e.to_string())),
            Err(e) => {
                warn!(machine_id = machine.id, "connection test failed: {}", e);
                Err(OrchestratorError::ConnectionFailed(format!(
                    "machine {} ({}): {}; {}",
                    machine.name,
                    machine.address(),
                    e,
                    e.hint()
                )))
            }
        }
    }

    /// Look the machine up, validate it and hand it back
    pub async fn validate_id(&self, id: Option<MachineId>) -> Result<Machine, OrchestratorError> {
        let Some(id) = id else {
            return Err(OrchestratorError::ValidationError(
                "machine id must be given".to_string(),
            ));
        };
        let machine = self
            .machines
            .get_machine(id)
            .await?
            .ok_or_else(|| not_found("machine", id))?;
        self.validate(Some(&machine)).await?;
        Ok(machine)
    }
}
