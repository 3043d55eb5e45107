use std::collections::BTreeMap;

use command_tree::{DynValue, Fault};
use serde::{Deserialize, Serialize};

/// Snapshot of a managed host, produced by the agent and consumed by the
/// orchestrator. Module entries are either the module's own state value or
/// the fault that kept it from being collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerState {
    pub agent_version: String,
    pub os: String,
    pub uid: u32,
    pub modules: BTreeMap<String, ModuleState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ModuleState {
    Ok { state: DynValue },
    Failed { fault: Fault },
}

impl ModuleState {
    pub fn state(&self) -> Option<&DynValue> {
        match self {
            ModuleState::Ok { state } => Some(state),
            ModuleState::Failed { .. } => None,
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            ModuleState::Ok { .. } => None,
            ModuleState::Failed { fault } => Some(fault),
        }
    }
}
