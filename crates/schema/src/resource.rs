use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use command_tree::DynValue;

use crate::connection::Connection;
use crate::manager::ResourceManager;
use crate::template::Template;

/// A concrete target the orchestrator drives: one entry per server (or other
/// managed thing) in an environment.
pub struct Resource {
    pub name: String,
    pub manager: Arc<dyn ResourceManager>,
    /// Name of the provider group this resource belongs to, if any.
    pub group: Option<String>,
    pub group_value: Option<DynValue>,
    pub value: Arc<dyn ResourceValue>,
    pub packages: BTreeSet<String>,
    /// Module name → configured instances for this resource.
    pub modules: BTreeMap<String, Vec<DynValue>>,
    /// Free-form attribute bag, exposed to templates as `self`. Mutated by
    /// template expansion and by state collection.
    attributes: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl Resource {
    pub fn new(
        name: impl Into<String>,
        manager: Arc<dyn ResourceManager>,
        value: Arc<dyn ResourceValue>,
    ) -> Self {
        Self {
            name: name.into(),
            manager,
            group: None,
            group_value: None,
            value,
            packages: BTreeSet::new(),
            modules: BTreeMap::new(),
            attributes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn attributes(&self) -> MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes().insert(key.into(), value);
    }

    /// The `self` value templates see: the attribute bag as a JSON object.
    pub fn template_self(&self) -> serde_json::Value {
        let attributes = self.attributes();
        serde_json::Value::Object(
            attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Provider-specific value backing a resource. Values that can open a
/// connection mark the resource as a server target.
pub trait ResourceValue: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    fn as_server(&self) -> Option<&dyn ServerResource> {
        None
    }
}

#[async_trait]
pub trait ServerResource: Send + Sync {
    async fn open_connection(&self) -> anyhow::Result<Arc<dyn Connection>>;
}

pub struct Environment {
    pub name: String,
    pub vars: BTreeMap<String, serde_json::Value>,
    /// Provider name → groups declared for it (used by decommission
    /// discovery even when no resource currently uses a group).
    pub groups: BTreeMap<String, Vec<String>>,
    pub resources: BTreeMap<String, Arc<Resource>>,
    pub resources_by_package: BTreeMap<String, Vec<Arc<Resource>>>,
    pub hooks: Vec<DeploymentHook>,
    /// Provider-level label scoping automatic removal of unused instances.
    pub decommission_tag: String,
}

pub struct DeploymentHook {
    pub before: bool,
    pub package: String,
    pub command_name: String,
    pub command: Arc<PackageCommandSpec>,
}

pub struct PackageSpec {
    pub name: String,
    pub tunnels: BTreeMap<String, TunnelSpec>,
    pub commands: BTreeMap<String, Arc<PackageCommandSpec>>,
    pub modules: Vec<PackageModule>,
}

pub struct PackageModule {
    pub module: String,
    pub config: serde_json::Value,
}

#[derive(Clone)]
pub struct TunnelSpec {
    /// Remote port the tunnel dials.
    pub port: u16,
    /// Host to dial from the peer; rendered per resource.
    pub host: Arc<dyn Template>,
}

/// A desired-command template bound to a package. Expansion produces one
/// execution per matching server.
pub struct PackageCommandSpec {
    /// Run on the operator's machine instead of the remote server.
    pub local: bool,
    /// Tunnels that must be open while the command runs; exposed to the
    /// command template under `tunnel`.
    pub tunnels: Vec<String>,
    pub commands: Vec<Arc<dyn Template>>,
    /// Which servers to run against: empty for the first, `*` for all, or a
    /// literal resource name.
    pub target: Arc<dyn Template>,
}
