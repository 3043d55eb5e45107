pub mod connection;
pub mod logger;
pub mod manager;
pub mod resource;
pub mod state;
pub mod template;

pub use connection::{
    is_command_not_found, is_permission_denied, Connection, PipeHandler, PipeStreams, ProgressFn,
};
pub use logger::{Logger, PrefixLogger};
pub use manager::{
    CalculateArgs, DefaultStateQuery, ManagerSet, ModuleManager, ResourceManager, StateQueryArgs,
};
pub use resource::{
    DeploymentHook, Environment, PackageCommandSpec, PackageModule, PackageSpec, Resource,
    ResourceValue, ServerResource, TunnelSpec,
};
pub use state::{ModuleState, ServerState};
pub use template::{Scope, Template, TemplateSource, TEMPLATE_SENTINEL};

/// Where the agent binary lives on every managed host.
pub const AGENT_PATH: &str = "/usr/local/bin/convoy-agent";

/// Version the orchestrator expects from agents; older agents are replaced.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration for one run: environments, packages and the template engine.
pub struct Config {
    pub environments: std::collections::BTreeMap<String, std::sync::Arc<Environment>>,
    pub packages: std::collections::BTreeMap<String, std::sync::Arc<PackageSpec>>,
    pub template_source: std::sync::Arc<dyn TemplateSource>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("environments", &self.environments.keys().collect::<Vec<_>>())
            .field("packages", &self.packages.keys().collect::<Vec<_>>())
            .field("template_source", &"<dyn TemplateSource>")
            .finish()
    }
}
