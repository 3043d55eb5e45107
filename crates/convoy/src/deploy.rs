use std::any::Any;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use command_tree::{
    monitor_channel, stream_call, Command, CommandNode, CommandState, DynValue, Fault,
    RootCommand, Runner,
};
use registry::modules::system::SystemState;
use schema::{
    is_command_not_found, is_permission_denied, CalculateArgs, Config, Connection, Environment,
    ManagerSet, ModuleState, PrefixLogger, Resource, Scope, ServerState, StateQueryArgs,
    AGENT_PATH, AGENT_VERSION, TEMPLATE_SENTINEL,
};
use tracing::info;

use crate::package::{build_package_commands, BuildPackageArgs, PackageContext};
use crate::render;

const SLOW_RPC_WARNING: Duration = Duration::from_secs(1);

pub struct DeployOptions {
    pub workers: usize,
    pub allow_decommission: bool,
    pub agent_bin: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeployStep {
    GatherState,
    ExpandTemplates,
    CalculateCommands,
    BeforeHooks,
    LocalCommands,
    RemoteCommands,
    AfterHooks,
    Decommission,
    Done,
}

impl DeployStep {
    fn next(self) -> Self {
        match self {
            DeployStep::GatherState => DeployStep::ExpandTemplates,
            DeployStep::ExpandTemplates => DeployStep::CalculateCommands,
            DeployStep::CalculateCommands => DeployStep::BeforeHooks,
            DeployStep::BeforeHooks => DeployStep::LocalCommands,
            DeployStep::LocalCommands => DeployStep::RemoteCommands,
            DeployStep::RemoteCommands => DeployStep::AfterHooks,
            DeployStep::AfterHooks => DeployStep::Decommission,
            DeployStep::Decommission => DeployStep::Done,
            DeployStep::Done => DeployStep::Done,
        }
    }
}

/// Where the agent binary is read from when a host needs a (new) copy.
pub struct AgentSource {
    path: PathBuf,
    cached: tokio::sync::Mutex<Option<Arc<Vec<u8>>>>,
}

impl AgentSource {
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        let path = explicit.unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.join("convoy-agent")))
                .unwrap_or_else(|| PathBuf::from("convoy-agent"))
        });
        Self {
            path,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn bytes(&self) -> anyhow::Result<Arc<Vec<u8>>> {
        let mut cached = self.cached.lock().await;
        if let Some(bytes) = cached.as_ref() {
            return Ok(Arc::clone(bytes));
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("could not read the agent binary at {}", self.path.display()))?;
        let bytes = Arc::new(bytes);
        *cached = Some(Arc::clone(&bytes));
        Ok(Arc::clone(&bytes))
    }
}

/// Drives every resource of `environment` through the eight deployment
/// phases in lock-step: all resources finish a phase before any enters the
/// next, and an error anywhere stops global progression at the phase
/// boundary. Returns whether the run finished without errors.
pub async fn deploy(
    config: Arc<Config>,
    environment: Arc<Environment>,
    managers: Arc<ManagerSet>,
    options: DeployOptions,
) -> anyhow::Result<bool> {
    set_template_globals(&config, &environment);
    let agent = Arc::new(AgentSource::resolve(options.agent_bin));
    let workers = options.workers.max(1);

    let root = RootCommand::new(format!("Deploying {}", environment.name));
    let mut commands: BTreeMap<String, Arc<DeployCommand>> = BTreeMap::new();
    for (name, resource) in &environment.resources {
        let command = Arc::new(DeployCommand {
            command: Command::new(""),
            resource: Arc::clone(resource),
            environment: Arc::clone(&environment),
            config: Arc::clone(&config),
            managers: Arc::clone(&managers),
            agent: Arc::clone(&agent),
            workers,
            step: Mutex::new(DeployStep::GatherState),
            connection: Mutex::new(None),
            server_state: Mutex::new(None),
            local_commands: Mutex::new(None),
            remote_commands: Mutex::new(None),
            elevate: AtomicBool::new(false),
        });
        root.as_command().add(
            format!("{}.{}", environment.name, name),
            command.clone() as Arc<dyn CommandNode>,
        );
        commands.insert(name.clone(), command);
    }
    let commands = Arc::new(commands);

    let package_context = PackageContext {
        config: Arc::clone(&config),
        environment: Arc::clone(&environment),
        managers: Arc::clone(&managers),
        agent: Arc::clone(&agent),
        workers,
    };
    let hook_calc = Arc::new(HookCalcCommand {
        command: Command::new(""),
        context: package_context,
        before_root: RootCommand::new("before_deployment"),
        after_root: RootCommand::new("after_deployment"),
        deploy_commands: Arc::clone(&commands),
    });
    let find_unused = Arc::new(FindUnusedCommand {
        command: Command::new(""),
        environment: Arc::clone(&environment),
        managers: Arc::clone(&managers),
        allow_decommission: options.allow_decommission,
    });

    let mut step = DeployStep::GatherState;
    let mut success = true;
    loop {
        match step {
            DeployStep::CalculateCommands => {
                if !environment.hooks.is_empty() {
                    root.as_command().add(
                        "Calculate deployment hooks",
                        hook_calc.clone() as Arc<dyn CommandNode>,
                    );
                }
            }
            DeployStep::BeforeHooks => {
                for child in hook_calc.before_root.as_command().children() {
                    let caption = child.as_command().caption();
                    root.as_command()
                        .add(format!("before_deployment: {caption}"), child);
                }
            }
            DeployStep::AfterHooks => {
                for child in hook_calc.after_root.as_command().children() {
                    let caption = child.as_command().caption();
                    root.as_command()
                        .add(format!("after_deployment: {caption}"), child);
                }
            }
            DeployStep::Decommission => {
                root.as_command().add(
                    "Check for unused servers",
                    find_unused.clone() as Arc<dyn CommandNode>,
                );
            }
            _ => {}
        }

        for command in commands.values() {
            command.set_step(step);
            command.as_command().set_state(CommandState::Ready);
        }

        let (events, receiver) = monitor_channel();
        let printer = render::spawn_printer(receiver);
        let runner = Runner::new(root.clone() as Arc<dyn CommandNode>, workers);
        let ok = runner.run(Some(events)).await;
        let _ = printer.await;

        if !ok {
            success = false;
            break;
        }
        step = step.next();
        if step == DeployStep::Done {
            break;
        }
    }

    for command in commands.values() {
        command.as_command().set_state(CommandState::Completed);
        if let Some(connection) = command.take_connection() {
            let _ = connection.close().await;
        }
    }
    info!(environment = %environment.name, success, "deployment finished");
    Ok(success)
}

fn set_template_globals(config: &Config, environment: &Environment) {
    config.template_source.add_global(
        "vars",
        serde_json::Value::Object(environment.vars.clone().into_iter().collect()),
    );
    config
        .template_source
        .add_global("environment", serde_json::Value::String(environment.name.clone()));
}

pub fn resource_scope(resource: &Resource) -> Scope {
    let mut scope = Scope::new();
    scope.insert("self".to_string(), resource.template_self());
    scope
}

/// Renders every string attribute containing the template sentinel against
/// the resource's own scope, in place. Returns the faults instead of
/// stopping at the first.
pub(crate) fn expand_resource_templates(resource: &Resource, config: &Config) -> Vec<Fault> {
    let scope = resource_scope(resource);
    let pending: Vec<(String, String)> = resource
        .attributes()
        .iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(text) if text.contains(TEMPLATE_SENTINEL) => {
                Some((key.clone(), text.clone()))
            }
            _ => None,
        })
        .collect();

    let mut faults = Vec::new();
    for (key, text) in pending {
        let rendered = config
            .template_source
            .new_template(&key, &text)
            .and_then(|template| template.render(&scope));
        match rendered {
            Ok(output) => resource.set_attribute(key, serde_json::Value::String(output)),
            Err(err) => faults.push(Fault::from(err)),
        }
    }
    faults
}

pub(crate) fn sudo_prefix(elevated: bool) -> &'static str {
    if elevated {
        "sudo -n "
    } else {
        ""
    }
}

/// Runs `op`, and on a permission-denied failure retries it once elevated.
/// A successful elevated retry latches elevation for every later operation
/// sharing the same flag.
pub(crate) async fn elevate_retry<F, Fut>(elevate: &AtomicBool, mut op: F) -> anyhow::Result<()>
where
    F: FnMut(bool) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let elevated = elevate.load(Ordering::SeqCst);
    match op(elevated).await {
        Ok(()) => Ok(()),
        Err(err) if !elevated && is_permission_denied(&format!("{err:#}")) => {
            op(true).await.map(|()| elevate.store(true, Ordering::SeqCst))
        }
        Err(err) => Err(err),
    }
}

pub(crate) struct StateContext {
    pub resource: Arc<Resource>,
    pub connection: Arc<dyn Connection>,
    pub config: Arc<Config>,
    pub managers: Arc<ManagerSet>,
    pub agent: Arc<AgentSource>,
    pub workers: usize,
}

/// Collects the full [`ServerState`] of a resource, installing or upgrading
/// the agent on the way when needed. Failures are recorded on `owner` and
/// surface as `None`.
pub(crate) async fn gather_state(
    ctx: &StateContext,
    elevate: &AtomicBool,
    owner: &Arc<dyn CommandNode>,
) -> Option<ServerState> {
    let cmd = owner.as_command();
    let scope = resource_scope(&ctx.resource);

    let mut query: BTreeMap<String, DynValue> = BTreeMap::new();
    for (name, manager) in &ctx.managers.modules {
        let instances = ctx.resource.modules.get(*name).cloned().unwrap_or_default();
        let logger = PrefixLogger::new(format!(" - {name}: "), cmd);
        let args = StateQueryArgs {
            instances: &instances,
            scope: &scope,
            config: &ctx.config,
            logger: &logger,
        };
        match manager.state_query(args).await {
            Ok(Some(module_query)) => {
                query.insert((*name).to_string(), module_query);
            }
            Ok(None) => {}
            Err(err) => {
                cmd.err(format!("Error calculating state query for {name}: {err:#}"));
                return None;
            }
        }
    }

    cmd.log(format!("Getting machine state with convoy-agent ({AGENT_PATH})"));
    let mut update_agent = false;
    let mut agent_exists = true;
    let mut state = match execute_get_state(ctx, elevate, &query, "Get state from existing agent", owner).await
    {
        Ok(state) => {
            if state.agent_version != AGENT_VERSION {
                cmd.log(format!(
                    " - server running outdated convoy-agent version {} (current is {AGENT_VERSION}); will update",
                    state.agent_version
                ));
                update_agent = true;
                Some(state)
            } else if state.os != "macos" && state.uid != 0 {
                // on linux hosts the agent needs root to see everything
                elevate.store(true, Ordering::SeqCst);
                match execute_get_state(ctx, elevate, &query, "Get state from existing agent", owner)
                    .await
                {
                    Ok(state) => Some(state),
                    Err(err) => {
                        cmd.err(format!("{err:#}"));
                        return None;
                    }
                }
            } else {
                Some(state)
            }
        }
        Err(err) => {
            agent_exists = !is_command_not_found(&format!("{err:#}"));
            update_agent = true;
            None
        }
    };

    if update_agent {
        cmd.log("Uploading new agent");
        if state.is_none() {
            cmd.log(" - checking OS (uname)");
            let uname = ctx
                .connection
                .execute_command("uname")
                .await
                .unwrap_or_default();
            let os = if uname.contains("Darwin") { "macos" } else { "linux" };
            cmd.log(format!("   it's {os} ({})", uname.trim()));
        }

        if agent_exists {
            cmd.log(format!(" - deleting preexisting convoy-agent ({AGENT_PATH})"));
            let deleted = elevate_retry(elevate, |elevated| async move {
                ctx.connection
                    .execute_command(&format!("{}rm {AGENT_PATH}", sudo_prefix(elevated)))
                    .await
                    .map(drop)
            })
            .await;
            if let Err(err) = deleted {
                cmd.err(format!("Error deleting {AGENT_PATH}: {err:#}; giving up"));
                return None;
            }
        }

        let bytes = match ctx.agent.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                cmd.err(format!("{err:#}"));
                return None;
            }
        };
        cmd.log(format!(" - uploading agent version {AGENT_VERSION}"));
        let uploaded = elevate_retry(elevate, |elevated| {
            let bytes = Arc::clone(&bytes);
            let owner = Arc::clone(owner);
            async move {
                ctx.connection
                    .write_file(
                        AGENT_PATH,
                        0o755,
                        bytes.len() as u64,
                        Box::new(std::io::Cursor::new(bytes.as_ref().clone())),
                        elevated,
                        Box::new(move |progress| owner.as_command().set_progress(progress)),
                    )
                    .await
            }
        })
        .await;
        cmd.set_progress(0.0);
        if let Err(err) = uploaded {
            cmd.err(format!("Could not upload agent to {AGENT_PATH}: {err:#}"));
            return None;
        }

        cmd.log(format!(" - getting machine state (again) with {AGENT_PATH}"));
        match execute_get_state(ctx, elevate, &query, "Get state from newly installed agent", owner)
            .await
        {
            Ok(new_state) => {
                if new_state.agent_version != AGENT_VERSION {
                    cmd.err(format!(
                        "Got version {} from convoy-agent after uploading {AGENT_VERSION}; updating did not work, giving up",
                        new_state.agent_version
                    ));
                    return None;
                }
                state = Some(new_state);
            }
            Err(err) => {
                cmd.err(format!("{err:#}"));
                return None;
            }
        }
    }

    let state = state?;
    let mut any_module_error = false;
    for (name, module_state) in &state.modules {
        if let Some(fault) = module_state.fault() {
            cmd.err(fault.clone().prefixed(&format!("Error getting {name} state: ")));
            any_module_error = true;
        }
    }
    if any_module_error {
        return None;
    }
    Some(state)
}

async fn execute_get_state(
    ctx: &StateContext,
    elevate: &AtomicBool,
    query: &BTreeMap<String, DynValue>,
    caption: &str,
    owner: &Arc<dyn CommandNode>,
) -> anyhow::Result<ServerState> {
    let cmd = owner.as_command();
    let root = RootCommand::new("Get agent state");
    root.as_command()
        .add(caption, registry::GetStateCommand::new(query.clone()));

    let started = Instant::now();
    let result = elevate_retry(elevate, |elevated| {
        let root = root.clone() as Arc<dyn CommandNode>;
        let attach = Arc::clone(owner);
        let workers = ctx.workers;
        let connection = Arc::clone(&ctx.connection);
        async move {
            connection
                .execute_pipe_command(
                    &format!("{}{AGENT_PATH} exec", sudo_prefix(elevated)),
                    Box::new(move |streams| {
                        Box::pin(async move {
                            let log_target = Arc::clone(&attach);
                            stream_call(
                                root,
                                attach,
                                workers,
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
                .await
        }
    })
    .await;
    let elapsed = started.elapsed();
    if elapsed > SLOW_RPC_WARNING {
        cmd.log(format!(" - warning: it took {elapsed:.1?}"));
    }

    if let Err(err) = result {
        if is_command_not_found(&format!("{err:#}")) {
            cmd.log(format!(" - could not find convoy-agent ({AGENT_PATH})"));
        } else {
            cmd.err(format!("Error running {AGENT_PATH}: {err:#}"));
        }
        return Err(err);
    }

    // dig the state out of the mirrored children, and drop the log-less
    // bookkeeping mirrors it arrived in
    let mut server_state: Option<ServerState> = None;
    for child in cmd.children() {
        if let Some(result) = child.as_command().result() {
            if let Some(state) = result.downcast_ref::<ServerState>() {
                server_state = Some(state.clone());
            }
        }
    }
    cmd.retain_children(|child| {
        let child_cmd = child.as_command();
        let carries_state = child_cmd
            .result()
            .map_or(false, |result| result.downcast_ref::<ServerState>().is_some());
        !(carries_state && child_cmd.entries().is_empty())
    });
    server_state.context("did not get a result from convoy-agent")
}

/// One resource's walk through the deployment pipeline. Every `execute`
/// performs the current phase and parks the node; the orchestrator readies
/// it again for the next phase.
struct DeployCommand {
    command: Command,
    resource: Arc<Resource>,
    environment: Arc<Environment>,
    config: Arc<Config>,
    managers: Arc<ManagerSet>,
    agent: Arc<AgentSource>,
    workers: usize,
    step: Mutex<DeployStep>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    server_state: Mutex<Option<ServerState>>,
    local_commands: Mutex<Option<Arc<RootCommand>>>,
    remote_commands: Mutex<Option<Arc<RootCommand>>>,
    elevate: AtomicBool,
}

impl DeployCommand {
    fn set_step(&self, step: DeployStep) {
        *self.step.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = step;
    }

    fn step(&self) -> DeployStep {
        *self.step.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn take_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn step_gather_state(self: Arc<Self>) {
        let manager_name = self.resource.manager.name();
        if self.resource.manager.supports_provision() {
            self.command.log(format!(
                "Provisioning {} ({manager_name})",
                self.resource.name
            ));
            let provisioned = self
                .resource
                .manager
                .provision(
                    self.resource.group_value.as_ref(),
                    &self.resource.value,
                    &self.command,
                )
                .await;
            if let Err(err) = provisioned {
                self.command.err(Fault::from(err).prefixed(&format!(
                    "Could not provision {} ({manager_name}): ",
                    self.resource.name
                )));
                return;
            }
        }

        if let Some(server) = self.resource.value.as_server() {
            self.command.log(format!(
                "Establishing connection to {} ({manager_name})",
                self.resource.name
            ));
            match server.open_connection().await {
                Ok(connection) => {
                    *self
                        .connection
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(connection);
                }
                Err(err) => {
                    self.command.err(Fault::from(err));
                    return;
                }
            }
        }

        let Some(connection) = self.connection() else {
            // nothing to inspect on connectionless resources
            return;
        };
        let ctx = StateContext {
            resource: Arc::clone(&self.resource),
            connection,
            config: Arc::clone(&self.config),
            managers: Arc::clone(&self.managers),
            agent: Arc::clone(&self.agent),
            workers: self.workers,
        };
        let owner = self.clone() as Arc<dyn CommandNode>;
        let Some(state) = gather_state(&ctx, &self.elevate, &owner).await else {
            return;
        };

        // expose host facts to templates
        if let Some(ModuleState::Ok { state: system }) = state.modules.get("system") {
            if let Some(system) = system.downcast_ref::<SystemState>() {
                self.resource.set_attribute(
                    "hostname",
                    serde_json::Value::String(system.hostname.clone()),
                );
                if let Ok(interfaces) = serde_json::to_value(&system.interfaces) {
                    self.resource.set_attribute("interfaces", interfaces);
                }
            }
        }

        *self
            .server_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(state);
        self.command
            .log("Waiting for state to be gathered from other servers");
    }

    fn step_expand_templates(&self) {
        for fault in expand_resource_templates(&self.resource, &self.config) {
            self.command.err(fault);
        }
    }

    async fn step_calculate_commands(&self) {
        self.command
            .log("Calculating commands to modify server to target state");
        let started = Instant::now();

        let local = RootCommand::new("Local commands");
        let remote = RootCommand::new("Remote commands");
        let server_state = self
            .server_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let connection = self.connection();
        let scope = resource_scope(&self.resource);

        let mut any_error = false;
        for (name, manager) in &self.managers.modules {
            let instances = self.resource.modules.get(*name).cloned().unwrap_or_default();
            let module_state = server_state
                .as_ref()
                .and_then(|state| state.modules.get(*name))
                .and_then(ModuleState::state)
                .cloned();
            if instances.is_empty() && module_state.is_none() {
                continue;
            }
            let prefix = format!(" - {name}: ");
            let logger = PrefixLogger::new(prefix.clone(), &self.command);
            let args = CalculateArgs {
                instances: &instances,
                state: module_state.as_ref(),
                local_commands: local.as_command(),
                remote_commands: remote.as_command(),
                connection: connection.as_ref(),
                environment: &self.environment,
                config: &self.config,
                scope: &scope,
                logger: &logger,
            };
            if let Err(err) = manager.calculate_commands(args).await {
                self.command.err(Fault::from(err).prefixed(&prefix));
                any_error = true;
            }
        }
        if any_error {
            return;
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_RPC_WARNING {
            self.command.log(format!(" - warning: it took {elapsed:.1?}"));
        }
        if local.as_command().children().is_empty() && remote.as_command().children().is_empty() {
            self.command
                .log("Remote system has correct state. No changes required.");
        }
        *self
            .local_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(local);
        *self
            .remote_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(remote);
    }

    fn step_local_commands(&self) {
        let local = self
            .local_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(local) = local else { return };
        let children = local.as_command().children();
        if children.is_empty() {
            return;
        }
        self.command.log("Executing local commands.");
        for child in children {
            let caption = child.as_command().caption();
            self.command.add(caption, child);
        }
    }

    async fn step_remote_commands(self: Arc<Self>) {
        let remote = self
            .remote_commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(remote) = remote else { return };
        if remote.as_command().children().is_empty() {
            return;
        }
        let Some(connection) = self.connection() else {
            self.command
                .err("remote commands were calculated but the resource has no connection");
            return;
        };
        self.command.log("Executing remote commands.");

        let attach = self.clone() as Arc<dyn CommandNode>;
        let workers = self.workers;
        let result = elevate_retry(&self.elevate, |elevated| {
            let connection = Arc::clone(&connection);
            let remote = remote.clone() as Arc<dyn CommandNode>;
            let attach = Arc::clone(&attach);
            async move {
                connection
                    .execute_pipe_command(
                        &format!("{}{AGENT_PATH} exec", sudo_prefix(elevated)),
                        Box::new(move |streams| {
                            Box::pin(async move {
                                let log_target = Arc::clone(&attach);
                                stream_call(
                                    remote,
                                    attach,
                                    workers,
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
                    .await
            }
        })
        .await;
        if let Err(err) = result {
            self.command.err(format!("{err:#}"));
        }
    }
}

#[async_trait]
impl CommandNode for DeployCommand {
    async fn execute(self: Arc<Self>) {
        match self.step() {
            DeployStep::GatherState => Arc::clone(&self).step_gather_state().await,
            DeployStep::ExpandTemplates => self.step_expand_templates(),
            DeployStep::CalculateCommands => self.step_calculate_commands().await,
            DeployStep::LocalCommands => self.step_local_commands(),
            DeployStep::RemoteCommands => Arc::clone(&self).step_remote_commands().await,
            DeployStep::BeforeHooks
            | DeployStep::AfterHooks
            | DeployStep::Decommission
            | DeployStep::Done => {}
        }
        // park until the orchestrator advances the phase barrier
        self.command.set_state(CommandState::Paused);
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Expands every deployment hook into package commands, collected under two
/// detached roots that the orchestrator re-parents at the matching phase.
struct HookCalcCommand {
    command: Command,
    context: PackageContext,
    before_root: Arc<RootCommand>,
    after_root: Arc<RootCommand>,
    deploy_commands: Arc<BTreeMap<String, Arc<DeployCommand>>>,
}

#[async_trait]
impl CommandNode for HookCalcCommand {
    async fn execute(self: Arc<Self>) {
        for hook in &self.context.environment.hooks {
            let parent = if hook.before {
                &self.before_root
            } else {
                &self.after_root
            };
            let deploy_commands = Arc::clone(&self.deploy_commands);
            let reuse = move |name: &str| -> Option<Arc<dyn Connection>> {
                deploy_commands.get(name).and_then(|command| command.connection())
            };
            let built = build_package_commands(BuildPackageArgs {
                parent: parent.as_command(),
                command_name: &hook.command_name,
                spec: &hook.command,
                package: &hook.package,
                force_target: None,
                extra_args: &[],
                reuse_connection: &reuse,
                ctx: &self.context,
            });
            if let Err(err) = built {
                self.command.err(Fault::from(err));
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

/// Asks every discovery-capable resource manager for instances carrying the
/// environment's decommission tag that the desired set no longer contains.
struct FindUnusedCommand {
    command: Command,
    environment: Arc<Environment>,
    managers: Arc<ManagerSet>,
    allow_decommission: bool,
}

#[async_trait]
impl CommandNode for FindUnusedCommand {
    async fn execute(self: Arc<Self>) {
        let mut desired: BTreeMap<&str, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for (manager_name, group_names) in &self.environment.groups {
            let entry = desired.entry(manager_name.as_str()).or_default();
            for group_name in group_names {
                entry.entry(group_name.clone()).or_default();
            }
        }
        for resource in self.environment.resources.values() {
            desired
                .entry(resource.manager.name())
                .or_default()
                .entry(resource.group.clone().unwrap_or_default())
                .or_default()
                .push(resource.name.clone());
        }

        let mut print_instructions = false;
        for (manager_name, groups) in desired {
            let Some(manager) = self.managers.resources.get(manager_name) else {
                continue;
            };
            if !manager.supports_discovery() {
                continue;
            }
            let staging = RootCommand::new("");
            let unused = manager
                .find_unused(
                    &groups,
                    &self.environment.decommission_tag,
                    staging.as_command(),
                    &self.command,
                )
                .await;
            let unused = match unused {
                Ok(unused) => unused,
                Err(err) => {
                    self.command.err(Fault::from(err));
                    return;
                }
            };
            if unused.is_empty() {
                continue;
            }
            if unused.len() == 1 {
                self.command.log(format!("Found unused {manager_name} server:"));
            } else {
                self.command
                    .log(format!("Found {} unused {manager_name} servers:", unused.len()));
            }
            for name in &unused {
                self.command.log(format!(" - {name}"));
            }
            let staged = staging.as_command().children();
            if self.allow_decommission {
                for child in staged {
                    let caption = child.as_command().caption();
                    self.command.add(caption, child);
                }
            } else if !staged.is_empty() {
                print_instructions = true;
            }
        }

        if print_instructions {
            self.command.log(
                "Use the flag --allow-decommission to automatically decommission unused servers",
            );
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn elevate_retry_latches_on_success() {
        let elevate = AtomicBool::new(false);
        let attempts = std::sync::Mutex::new(Vec::new());
        let result = elevate_retry(&elevate, |elevated| {
            attempts.lock().expect("lock").push(elevated);
            async move {
                if elevated {
                    Ok(())
                } else {
                    anyhow::bail!("scp: /usr/local/bin: Permission denied")
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(*attempts.lock().expect("lock"), vec![false, true]);
        assert!(elevate.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn elevate_retry_passes_other_errors_through() {
        let elevate = AtomicBool::new(false);
        let result = elevate_retry(&elevate, |_| async { anyhow::bail!("connection reset") }).await;
        assert!(result.is_err());
        assert!(!elevate.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn already_elevated_operations_do_not_retry() {
        let elevate = AtomicBool::new(true);
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = elevate_retry(&elevate, |elevated| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                assert!(elevated);
                anyhow::bail!("Permission denied")
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deploy_steps_advance_in_order() {
        let mut step = DeployStep::GatherState;
        let mut seen = vec![step];
        while step != DeployStep::Done {
            step = step.next();
            seen.push(step);
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(seen[3], DeployStep::BeforeHooks);
        assert_eq!(seen[7], DeployStep::Decommission);
    }
}
