pub mod exclusive;
pub mod modules;
pub mod resources;
pub mod services;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use command_tree::{codec, Command, CommandNode, DynValue, Fault};
use futures_util::FutureExt;
use schema::{DefaultStateQuery, ManagerSet, ModuleState, ServerState, AGENT_VERSION};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

static BUILTIN: LazyLock<ManagerSet> = LazyLock::new(|| {
    ManagerSet::default()
        .with_module(Arc::new(modules::system::SystemManager))
        .with_module(Arc::new(modules::file::FileManager))
        .with_module(Arc::new(modules::container::ContainerManager))
        .with_resource(Arc::new(resources::server::ServerManager))
        .with_resource(Arc::new(resources::localhost::LocalhostManager))
});

/// The module and resource managers compiled into this build. Both the
/// orchestrator and the agent must agree on this set.
pub fn builtin() -> &'static ManagerSet {
    &BUILTIN
}

/// Populates the wire codec with every node and value type that can cross a
/// stream. Must run at process start in both the tool and the agent;
/// unregistered types fail encoding, which is fatal to the session.
pub fn wire_register() {
    codec::register_node::<command_tree::RootCommand>("root");
    codec::register_node::<command_tree::MirrorCommand>("mirror");
    codec::register_node::<command_tree::ShellCommands>("shell_commands");
    codec::register_node::<command_tree::ExecCommand>("exec_command");
    codec::register_node::<GetStateCommand>("get_state");
    codec::register_value::<DefaultStateQuery>("default_state_query");
    codec::register_value::<ServerState>("server_state");
    for manager in builtin().modules.values() {
        manager.register_wire_types();
    }
}

/// Shipped to the agent as the sole node of the phase-1 tree: collects every
/// requested module state concurrently and returns a [`ServerState`] as the
/// node result.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GetStateCommand {
    command: Command,
    pub query: BTreeMap<String, DynValue>,
}

impl GetStateCommand {
    pub fn new(query: BTreeMap<String, DynValue>) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            query,
        })
    }
}

#[async_trait]
impl CommandNode for GetStateCommand {
    async fn execute(self: Arc<Self>) {
        let mut modules: BTreeMap<String, ModuleState> = BTreeMap::new();
        let mut collectors = JoinSet::new();
        for (name, query) in self.query.clone() {
            match builtin().modules.get(name.as_str()) {
                Some(manager) => {
                    let manager = Arc::clone(manager);
                    collectors.spawn(async move {
                        let outcome =
                            AssertUnwindSafe(manager.get_state(query)).catch_unwind().await;
                        let state = match outcome {
                            Ok(Ok(state)) => ModuleState::Ok { state },
                            Ok(Err(err)) => ModuleState::Failed { fault: err.into() },
                            Err(payload) => ModuleState::Failed {
                                fault: Fault::new(format!(
                                    "panic while collecting state: {}",
                                    panic_text(payload.as_ref())
                                )),
                            },
                        };
                        (name, state)
                    });
                }
                None => {
                    modules.insert(
                        name.clone(),
                        ModuleState::Failed {
                            fault: Fault::new(format!("agent has no module {name:?}")),
                        },
                    );
                }
            }
        }
        while let Some(joined) = collectors.join_next().await {
            if let Ok((name, state)) = joined {
                modules.insert(name, state);
            }
        }

        let state = ServerState {
            agent_version: AGENT_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            uid: current_uid(),
            modules,
        };
        self.command.set_result(DynValue::new(state));
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no failure modes and touches no memory
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use command_tree::CommandState;

    #[tokio::test]
    async fn unknown_module_becomes_a_failed_entry() {
        wire_register();
        let mut query = BTreeMap::new();
        query.insert(
            "no_such_module".to_string(),
            DynValue::new(DefaultStateQuery::default()),
        );
        let node = GetStateCommand::new(query);
        node.clone().execute().await;

        let result = node.as_command().result().expect("result");
        let state = result.downcast_ref::<ServerState>().expect("server state");
        assert_eq!(state.agent_version, AGENT_VERSION);
        let entry = state.modules.get("no_such_module").expect("entry");
        assert!(entry.fault().is_some());
        assert_eq!(node.as_command().state(), CommandState::Ready);
    }
}
