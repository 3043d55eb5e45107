use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use command_tree::commands::os_exec;
use command_tree::{
    monitor_channel, stream_call, Command, CommandNode, Fault, RootCommand, Runner, ShellCommands,
};
use schema::{
    Config, Connection, Environment, ManagerSet, PackageCommandSpec, Resource, Scope, TunnelSpec,
    AGENT_PATH,
};

use crate::deploy::{
    expand_resource_templates, gather_state, resource_scope, AgentSource, StateContext,
};
use crate::render;

#[derive(Clone)]
pub struct PackageContext {
    pub config: Arc<Config>,
    pub environment: Arc<Environment>,
    pub managers: Arc<ManagerSet>,
    pub agent: Arc<AgentSource>,
    pub workers: usize,
}

pub(crate) struct BuildPackageArgs<'a> {
    pub parent: &'a Command,
    pub command_name: &'a str,
    pub spec: &'a Arc<PackageCommandSpec>,
    pub package: &'a str,
    pub force_target: Option<&'a str>,
    pub extra_args: &'a [String],
    pub reuse_connection: &'a dyn Fn(&str) -> Option<Arc<dyn Connection>>,
    pub ctx: &'a PackageContext,
}

/// Which servers a target selector picks: empty (or `first`) means the first
/// matching server, `*` every server, anything else a specific resource.
pub(crate) fn target_selects(target: &str, resource_name: &str, already_added: bool) -> bool {
    match target {
        "*" => true,
        "" | "first" => !already_added,
        name => name == resource_name,
    }
}

/// Expands a package command into one execution node per matching server,
/// appended under `parent`.
pub(crate) fn build_package_commands(args: BuildPackageArgs<'_>) -> anyhow::Result<()> {
    let rendered_target = args
        .spec
        .target
        .render(&Scope::new())
        .map_err(|err| Fault::from(err).prefixed("Bad target template: "))?;
    let target = args.force_target.unwrap_or(&rendered_target);

    let mut discard_reasons: BTreeMap<String, String> = BTreeMap::new();
    let mut added = false;

    let empty = Vec::new();
    let resources = args
        .ctx
        .environment
        .resources_by_package
        .get(args.package)
        .unwrap_or(&empty);
    for resource in resources {
        if resource.value.as_server().is_none() {
            continue;
        }

        // local commands that need tunnels can only target servers that
        // actually declare them
        let mut tunnels: BTreeMap<String, TunnelSpec> = BTreeMap::new();
        if args.spec.local {
            for tunnel_name in &args.spec.tunnels {
                for package_name in &resource.packages {
                    if let Some(package) = args.ctx.config.packages.get(package_name) {
                        if let Some(tunnel) = package.tunnels.get(tunnel_name) {
                            tunnels.insert(tunnel_name.clone(), tunnel.clone());
                            break;
                        }
                    }
                }
            }
            if tunnels.len() != args.spec.tunnels.len() {
                discard_reasons.insert(
                    resource.name.clone(),
                    format!(
                        "does not have all the required tunnels {:?}; only has {:?}",
                        args.spec.tunnels,
                        tunnels.keys().collect::<Vec<_>>()
                    ),
                );
                continue;
            }
        }

        // if the command templates cannot render yet, the missing variables
        // are host facts and we must collect remote state first
        let mut pretend_tunnels = serde_json::Map::new();
        for (index, name) in tunnels.keys().enumerate() {
            pretend_tunnels.insert(
                name.clone(),
                serde_json::Value::String(format!("127.0.0.1:{}", 9872 + index)),
            );
        }
        let mut probe_scope = resource_scope(resource);
        probe_scope.insert("tunnel".to_string(), serde_json::Value::Object(pretend_tunnels));
        let mut require_remote_state = args
            .spec
            .commands
            .iter()
            .any(|template| template.render(&probe_scope).is_err());
        require_remote_state = require_remote_state
            || !expand_resource_templates(resource, &args.ctx.config).is_empty();

        if !target_selects(target, &resource.name, added) {
            if !matches!(target, "" | "first" | "*") {
                discard_reasons.insert(
                    resource.name.clone(),
                    format!("does not have the name {target:?}"),
                );
            }
            continue;
        }

        let caption = if args.spec.local {
            format!(
                "{} against {}.{}",
                args.command_name, args.ctx.environment.name, resource.name
            )
        } else {
            format!(
                "{} on {}.{}",
                args.command_name, args.ctx.environment.name, resource.name
            )
        };
        let node = Arc::new(PackageCommand {
            command: Command::new(""),
            ctx: args.ctx.clone(),
            spec: Arc::clone(args.spec),
            resource: Some(Arc::clone(resource)),
            connection: Mutex::new((args.reuse_connection)(&resource.name)),
            tunnels,
            require_remote_state,
            extra_args: args.extra_args.to_vec(),
            elevate: AtomicBool::new(false),
        });
        args.parent.add(caption, node);
        added = true;
    }

    // a purely local command without tunnels runs fine with no server at
    // all, unless a specific server was demanded
    if !added
        && args.spec.local
        && args.spec.tunnels.is_empty()
        && matches!(target, "" | "first" | "*")
    {
        let node = Arc::new(PackageCommand {
            command: Command::new(""),
            ctx: args.ctx.clone(),
            spec: Arc::clone(args.spec),
            resource: None,
            connection: Mutex::new(None),
            tunnels: BTreeMap::new(),
            require_remote_state: false,
            extra_args: args.extra_args.to_vec(),
            elevate: AtomicBool::new(false),
        });
        args.parent.add(args.command_name, node);
        added = true;
    }

    if !added {
        let mut fault = Fault::new(format!(
            "Could not find any servers to run the command {:?} on.",
            args.command_name
        ));
        for (name, reason) in discard_reasons {
            fault = fault.with_data(name, reason);
        }
        return Err(fault.into());
    }
    Ok(())
}

/// One execution of a package command against one server (or locally).
struct PackageCommand {
    command: Command,
    ctx: PackageContext,
    spec: Arc<PackageCommandSpec>,
    resource: Option<Arc<Resource>>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    tunnels: BTreeMap<String, TunnelSpec>,
    require_remote_state: bool,
    extra_args: Vec<String>,
    elevate: AtomicBool,
}

impl PackageCommand {
    async fn run(self: Arc<Self>, connection: Option<Arc<dyn Connection>>) {
        if self.require_remote_state {
            let (Some(connection), Some(resource)) = (&connection, &self.resource) else {
                self.command
                    .err("command needs remote state but the resource has no connection");
                return;
            };
            let ctx = StateContext {
                resource: Arc::clone(resource),
                connection: Arc::clone(connection),
                config: Arc::clone(&self.ctx.config),
                managers: Arc::clone(&self.ctx.managers),
                agent: Arc::clone(&self.ctx.agent),
                workers: self.ctx.workers,
            };
            let owner = Arc::clone(&self) as Arc<dyn CommandNode>;
            if gather_state(&ctx, &self.elevate, &owner).await.is_none() {
                return;
            }
            let faults = expand_resource_templates(resource, &self.ctx.config);
            if !faults.is_empty() {
                for fault in faults {
                    self.command.err(fault);
                }
                return;
            }
        }

        let mut tunnel_values = serde_json::Map::new();
        for (name, tunnel) in &self.tunnels {
            let Some(connection) = &connection else {
                self.command.err("tunnels need a connection");
                return;
            };
            let host_scope = self
                .resource
                .as_ref()
                .map(|resource| resource_scope(resource))
                .unwrap_or_default();
            let host = match tunnel.host.render(&host_scope) {
                Ok(host) => host,
                Err(err) => {
                    self.command.err(Fault::from(err));
                    return;
                }
            };
            match connection.start_tunnel(0, tunnel.port, &host, false).await {
                Ok(port) => {
                    tunnel_values.insert(
                        name.clone(),
                        serde_json::Value::String(format!("{}:{port}", preferred_host())),
                    );
                }
                Err(err) => {
                    self.command
                        .err(format!("Error starting tunnel {name}: {err:#}"));
                    return;
                }
            }
        }

        let mut scope = self
            .resource
            .as_ref()
            .map(|resource| resource_scope(resource))
            .unwrap_or_default();
        scope.insert("tunnel".to_string(), serde_json::Value::Object(tunnel_values));

        let mut rendered = Vec::new();
        for template in &self.spec.commands {
            match template.render(&scope) {
                Ok(mut text) => {
                    if !self.extra_args.is_empty() {
                        text.push(' ');
                        text.push_str(&self.extra_args.join(" "));
                    }
                    rendered.push(text);
                }
                Err(err) => {
                    self.command.err(Fault::from(err));
                    return;
                }
            }
        }

        if self.spec.local {
            for command in &rendered {
                let result = os_exec(
                    &self.command,
                    "",
                    "> ",
                    "/bin/bash",
                    &["-c".to_string(), command.clone()],
                )
                .await;
                if let Err(fault) = result {
                    self.command.err(fault);
                    return;
                }
            }
            return;
        }

        let Some(connection) = &connection else {
            self.command.err("remote command needs a connection");
            return;
        };
        let resource_name = self
            .resource
            .as_ref()
            .map(|resource| resource.name.clone())
            .unwrap_or_default();
        let root = RootCommand::new("remote command");
        root.as_command().add(
            format!("Run on {resource_name}"),
            ShellCommands::new("", None, "> ", rendered),
        );
        let attach = Arc::clone(&self) as Arc<dyn CommandNode>;
        let root_node = root as Arc<dyn CommandNode>;
        let result = connection
            .execute_pipe_command(
                &format!("{AGENT_PATH} exec"),
                Box::new(move |streams| {
                    Box::pin(async move {
                        let log_target = Arc::clone(&attach);
                        stream_call(
                            root_node,
                            attach,
                            1,
                            streams.stdout,
                            streams.stderr,
                            streams.stdin,
                            move |line| log_target.as_command().log(line),
                        )
                        .await?;
                        Ok(())
                    })
                }),
            )
            .await;
        if let Err(err) = result {
            self.command.err(format!("{err:#}"));
        }
    }
}

#[async_trait]
impl CommandNode for PackageCommand {
    async fn execute(self: Arc<Self>) {
        let mut connection = self
            .connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let mut owns_connection = false;

        // local commands with tunnels always get a fresh connection so the
        // tunnels die with this execution
        if connection.is_none() || (self.spec.local && !self.tunnels.is_empty()) {
            if let Some(resource) = &self.resource {
                if resource.manager.supports_provision() {
                    let provisioned = resource
                        .manager
                        .provision(resource.group_value.as_ref(), &resource.value, &self.command)
                        .await;
                    if let Err(err) = provisioned {
                        self.command.err(Fault::from(err));
                        return;
                    }
                }
                let Some(server) = resource.value.as_server() else {
                    self.command
                        .err(format!("{} is not a server resource", resource.name));
                    return;
                };
                match server.open_connection().await {
                    Ok(opened) => {
                        connection = Some(opened);
                        owns_connection = true;
                    }
                    Err(err) => {
                        self.command.err(format!(
                            "Could not get connection to {}: {err:#}",
                            resource.name
                        ));
                        return;
                    }
                }
            }
        }

        Arc::clone(&self).run(connection.clone()).await;

        if owns_connection {
            if let Some(connection) = connection {
                let _ = connection.close().await;
            }
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Finds a package command by name across all packages.
pub fn find_command(config: &Config, name: &str) -> Option<(String, Arc<PackageCommandSpec>)> {
    for (package_name, package) in &config.packages {
        if let Some(spec) = package.commands.get(name) {
            return Some((package_name.clone(), Arc::clone(spec)));
        }
    }
    None
}

/// Entry point for `convoy run`: expands the command and drives the
/// resulting tree.
pub async fn run_package_command(
    ctx: &PackageContext,
    command_name: &str,
    spec: &Arc<PackageCommandSpec>,
    package: &str,
    force_target: Option<&str>,
    extra_args: &[String],
) -> anyhow::Result<bool> {
    let root = RootCommand::new(format!("Run {command_name}"));
    build_package_commands(BuildPackageArgs {
        parent: root.as_command(),
        command_name,
        spec,
        package,
        force_target,
        extra_args,
        reuse_connection: &|_| None,
        ctx,
    })?;

    let (events, receiver) = monitor_channel();
    let printer = render::spawn_printer(receiver);
    let runner = Runner::new(root as Arc<dyn CommandNode>, 10);
    let ok = runner.run(Some(events)).await;
    let _ = printer.await;
    Ok(ok)
}

fn preferred_host() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        std::process::Command::new("hostname")
            .arg("-I")
            .output()
            .ok()
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .and_then(|text| text.split_whitespace().next().map(str::to_string))
            .unwrap_or_else(|| "127.0.0.1".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn target_selection_matches_the_contract() {
        assert!(target_selects("*", "a", false));
        assert!(target_selects("*", "a", true));
        assert!(target_selects("", "a", false));
        assert!(!target_selects("", "a", true));
        assert!(target_selects("first", "a", false));
        assert!(target_selects("b", "b", true));
        assert!(!target_selects("b", "a", false));
    }

    const SAMPLE: &str = r#"
[environment.test.resource.one]
manager = "localhost"
packages = ["tools"]

[environment.test.resource.two]
manager = "localhost"
packages = ["tools"]

[package.tools.command.greet]
local = true
commands = ["echo hello"]
target = "*"
"#;

    fn context() -> PackageContext {
        let managers = Arc::new(registry::builtin().clone());
        let config = config::parse(SAMPLE, &managers).expect("config");
        let environment = config.environments.get("test").cloned().expect("environment");
        PackageContext {
            config,
            environment,
            managers,
            agent: Arc::new(AgentSource::resolve(None)),
            workers: 2,
        }
    }

    #[test]
    fn star_target_expands_to_every_server() {
        let ctx = context();
        let spec = ctx.config.packages["tools"].commands["greet"].clone();
        let root = RootCommand::new("run");
        build_package_commands(BuildPackageArgs {
            parent: root.as_command(),
            command_name: "greet",
            spec: &spec,
            package: "tools",
            force_target: None,
            extra_args: &[],
            reuse_connection: &|_| None,
            ctx: &ctx,
        })
        .expect("build");
        assert_eq!(root.as_command().children().len(), 2);
    }

    #[test]
    fn first_target_expands_to_one_server() {
        let ctx = context();
        let spec = ctx.config.packages["tools"].commands["greet"].clone();
        let root = RootCommand::new("run");
        build_package_commands(BuildPackageArgs {
            parent: root.as_command(),
            command_name: "greet",
            spec: &spec,
            package: "tools",
            force_target: Some(""),
            extra_args: &[],
            reuse_connection: &|_| None,
            ctx: &ctx,
        })
        .expect("build");
        assert_eq!(root.as_command().children().len(), 1);
    }

    #[test]
    fn unknown_target_reports_discard_reasons() {
        let ctx = context();
        let spec = ctx.config.packages["tools"].commands["greet"].clone();
        let root = RootCommand::new("run");
        let err = build_package_commands(BuildPackageArgs {
            parent: root.as_command(),
            command_name: "greet",
            spec: &spec,
            package: "tools",
            force_target: Some("absent"),
            extra_args: &[],
            reuse_connection: &|_| None,
            ctx: &ctx,
        })
        .expect_err("must fail");
        let text = format!("{err:#}");
        assert!(text.contains("Could not find any servers"));
        assert!(text.contains("absent"));
    }

    #[tokio::test]
    async fn local_command_runs_and_logs() {
        let ctx = context();
        let spec = ctx.config.packages["tools"].commands["greet"].clone();
        let ok = run_package_command(&ctx, "greet", &spec, "tools", Some(""), &[])
            .await
            .expect("run");
        assert!(ok);
    }
}
