use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use command_tree::{Command, DynValue};
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::logger::Logger;
use crate::resource::{Environment, ResourceValue};
use crate::template::Scope;
use crate::Config;

/// Query sent to modules that do not compute their own; carries nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultStateQuery {}

pub struct StateQueryArgs<'a> {
    pub instances: &'a [DynValue],
    pub scope: &'a Scope,
    pub config: &'a Config,
    pub logger: &'a dyn Logger,
}

pub struct CalculateArgs<'a> {
    pub instances: &'a [DynValue],
    /// The module's state from phase 1, absent when the resource has no
    /// connection and the module was never queried.
    pub state: Option<&'a DynValue>,
    pub local_commands: &'a Command,
    pub remote_commands: &'a Command,
    pub connection: Option<&'a Arc<dyn Connection>>,
    pub environment: &'a Environment,
    pub config: &'a Config,
    pub scope: &'a Scope,
    pub logger: &'a dyn Logger,
}

/// Manages one desired-state concern on a server (container images present,
/// files in place, ...). Implementations must be pure with respect to the
/// arguments they receive; cross-cutting state is explicit.
#[async_trait]
pub trait ModuleManager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deserializes one configuration entry into this module's own type.
    fn parse_instance(&self, raw: &serde_json::Value) -> anyhow::Result<DynValue>;

    /// True when `state_query` needs configured instances to build a query;
    /// the agent's `getstate` diagnostic skips such modules.
    fn requires_query(&self) -> bool {
        false
    }

    /// Builds the query object shipped to the agent. `None` skips state
    /// collection for this module on this resource.
    async fn state_query(&self, _args: StateQueryArgs<'_>) -> anyhow::Result<Option<DynValue>> {
        Ok(Some(DynValue::new(DefaultStateQuery::default())))
    }

    /// Runs inside the agent: inspects the host and returns this module's
    /// state for the given query.
    async fn get_state(&self, query: DynValue) -> anyhow::Result<DynValue>;

    /// Runs in the orchestrator: compares desired configuration against the
    /// collected state and appends mutation commands to the local and remote
    /// trees.
    async fn calculate_commands(&self, args: CalculateArgs<'_>) -> anyhow::Result<()>;

    /// Registers this module's node and value types with the wire codec.
    fn register_wire_types(&self) {}
}

/// Provides resources of one kind (explicit servers, local machine, a cloud
/// provider, ...).
#[async_trait]
pub trait ResourceManager: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse_group(&self, _raw: &serde_json::Value) -> anyhow::Result<DynValue> {
        anyhow::bail!("resource manager {:?} has no group configuration", self.name())
    }

    fn parse_resource(&self, raw: &serde_json::Value) -> anyhow::Result<Arc<dyn ResourceValue>>;

    fn supports_provision(&self) -> bool {
        false
    }

    /// Brings the backing instance into existence (or up to date) before the
    /// orchestrator connects to it.
    async fn provision(
        &self,
        _group: Option<&DynValue>,
        _resource: &Arc<dyn ResourceValue>,
        _logger: &dyn Logger,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn supports_discovery(&self) -> bool {
        false
    }

    /// Enumerates instances tagged with `decommission_tag` that are not in
    /// `desired` (group name → expected resource names), appending removal
    /// commands under `decommission_root`. Returns the unused names.
    async fn find_unused(
        &self,
        _desired: &BTreeMap<String, Vec<String>>,
        _decommission_tag: &str,
        _decommission_root: &Command,
        _logger: &dyn Logger,
    ) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// The module and resource managers available to one run. Binaries use the
/// built-in set; tests assemble their own.
#[derive(Default, Clone)]
pub struct ManagerSet {
    pub modules: BTreeMap<&'static str, Arc<dyn ModuleManager>>,
    pub resources: BTreeMap<&'static str, Arc<dyn ResourceManager>>,
}

impl ManagerSet {
    pub fn with_module(mut self, manager: Arc<dyn ModuleManager>) -> Self {
        self.modules.insert(manager.name(), manager);
        self
    }

    pub fn with_resource(mut self, manager: Arc<dyn ResourceManager>) -> Self {
        self.resources.insert(manager.name(), manager);
        self
    }
}
