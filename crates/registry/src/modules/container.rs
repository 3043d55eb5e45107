use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use command_tree::commands::os_exec;
use command_tree::{codec, Command, CommandNode, DynValue};
use schema::{CalculateArgs, Connection, ModuleManager};
use serde::{Deserialize, Serialize};
use tokio::process::Command as OsCommand;

use crate::exclusive::machine_exclusive;
use crate::services::{self, REGISTRY_REMOTE_PORT};

/// Desired-state container runtime concern, driven through the `docker` CLI:
/// install the runtime where missing, ship locally built images through a
/// shared registry, and keep the configured containers running.
pub struct ContainerManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name; may be a template.
    pub name: String,
    /// Image reference; may be a template. Locally present images are pushed
    /// through the shared registry, everything else is pulled by the host.
    pub image: String,
    #[serde(default)]
    pub command: Option<String>,
    /// Extra `docker run` options.
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerModuleState {
    pub installed: bool,
    pub containers: Vec<ContainerInfo>,
    pub images: Vec<ImageInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub reference: String,
    pub id: String,
}

/// True when a container with the desired name already runs the desired
/// image.
pub fn container_up_to_date(name: &str, run_ref: &str, containers: &[ContainerInfo]) -> bool {
    containers
        .iter()
        .any(|c| c.name == name && c.image == run_ref && c.state == "running")
}

/// True when the host is missing (or has a stale copy of) the image under
/// `reference`.
pub fn image_push_needed(local_id: &str, reference: &str, remote: &[ImageInfo]) -> bool {
    !remote.iter().any(|i| i.reference == reference && i.id == local_id)
}

fn registry_reference(image: &str) -> String {
    format!("localhost:{REGISTRY_REMOTE_PORT}/{image}")
}

#[derive(Deserialize)]
struct DockerPsLine {
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
}

#[derive(Deserialize)]
struct DockerImageLine {
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "ID")]
    id: String,
}

async fn docker_json_lines(args: &[&str]) -> anyhow::Result<Option<Vec<String>>> {
    let output = match OsCommand::new("docker").args(args).output().await {
        Ok(output) => output,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("run docker"),
    };
    if !output.status.success() {
        anyhow::bail!(
            "docker {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(Some(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
    ))
}

async fn local_images() -> anyhow::Result<BTreeMap<String, String>> {
    let lines = docker_json_lines(&["image", "ls", "--no-trunc", "--format", "{{json .}}"])
        .await?
        .context("docker is not installed on this machine")?;
    let mut images = BTreeMap::new();
    for line in lines {
        let image: DockerImageLine = serde_json::from_str(&line)?;
        images.insert(format!("{}:{}", image.repository, image.tag), image.id);
    }
    Ok(images)
}

#[async_trait]
impl ModuleManager for ContainerManager {
    fn name(&self) -> &'static str {
        "container"
    }

    fn parse_instance(&self, raw: &serde_json::Value) -> anyhow::Result<DynValue> {
        let config: ContainerConfig =
            serde_json::from_value(raw.clone()).context("bad container module configuration")?;
        Ok(DynValue::new(config))
    }

    async fn get_state(&self, _query: DynValue) -> anyhow::Result<DynValue> {
        let mut state = ContainerModuleState::default();
        let Some(ps_lines) =
            docker_json_lines(&["ps", "-a", "--no-trunc", "--format", "{{json .}}"]).await?
        else {
            return Ok(DynValue::new(state));
        };
        state.installed = true;
        for line in ps_lines {
            let entry: DockerPsLine = serde_json::from_str(&line)?;
            state.containers.push(ContainerInfo {
                name: entry.names,
                image: entry.image,
                state: entry.state,
            });
        }
        let image_lines = docker_json_lines(&["image", "ls", "--no-trunc", "--format", "{{json .}}"])
            .await?
            .unwrap_or_default();
        for line in image_lines {
            let entry: DockerImageLine = serde_json::from_str(&line)?;
            state.images.push(ImageInfo {
                reference: format!("{}:{}", entry.repository, entry.tag),
                id: entry.id,
            });
        }
        Ok(DynValue::new(state))
    }

    async fn calculate_commands(&self, args: CalculateArgs<'_>) -> anyhow::Result<()> {
        if args.instances.is_empty() {
            return Ok(());
        }
        let state = args
            .state
            .context("no container state was collected for this resource")?
            .downcast_ref::<ContainerModuleState>()
            .context("unexpected container module state type")?;

        // everything below the install node waits for the runtime
        let install_node = if state.installed {
            None
        } else {
            Some(args.remote_commands.add(
                "Install container runtime",
                InstallRuntimeCommand::new(),
            ))
        };
        let remote_parent: &Command = match &install_node {
            Some(node) => node.as_command(),
            None => args.remote_commands,
        };

        let render = |location: &str, text: &str| -> anyhow::Result<String> {
            args.config
                .template_source
                .new_template(location, text)?
                .render(args.scope)
        };

        let local = local_images().await?;
        let mut pushes: Vec<String> = Vec::new();
        let mut desired_refs: Vec<String> = Vec::new();

        for instance in args.instances {
            let config = instance
                .downcast_ref::<ContainerConfig>()
                .context("unexpected container module instance type")?;
            let name = render("container.name", &config.name)?;
            let image = render("container.image", &config.image)?;
            let command = match &config.command {
                Some(command) => Some(render("container.command", command)?),
                None => None,
            };
            let options = config
                .options
                .iter()
                .map(|option| render("container.options", option))
                .collect::<anyhow::Result<Vec<_>>>()?;

            // locally built images travel through the shared registry
            let run_ref = match local.get(&image) {
                Some(local_id) => {
                    let reference = registry_reference(&image);
                    if image_push_needed(local_id, &reference, &state.images) {
                        pushes.push(image.clone());
                    }
                    reference
                }
                None => image.clone(),
            };
            desired_refs.push(run_ref.clone());

            if container_up_to_date(&name, &run_ref, &state.containers) {
                args.logger.log(format!("container {name} is up to date"));
                continue;
            }
            remote_parent.add(
                format!("Run container {name}"),
                RunContainerCommand::new(name, run_ref, command, options),
            );
        }

        if !pushes.is_empty() {
            let connection = args
                .connection
                .context("image pushes need a connection to the resource")?;
            let share = StartRegistryCommand::new(Arc::clone(connection));
            for image in pushes {
                share
                    .as_command()
                    .add(format!("Push {image}"), PushImageCommand::new(image));
            }
            args.local_commands.add("Share images", share);
        }

        let stale: Vec<String> = state
            .images
            .iter()
            .filter(|image| {
                image.reference.starts_with(&format!("localhost:{REGISTRY_REMOTE_PORT}/"))
                    && !desired_refs.contains(&image.reference)
            })
            .map(|image| image.reference.clone())
            .collect();
        if !stale.is_empty() {
            remote_parent.add("Remove superseded images", RemoveImagesCommand::new(stale));
        }
        Ok(())
    }

    fn register_wire_types(&self) {
        codec::register_value::<ContainerModuleState>("container_state");
        codec::register_node::<InstallRuntimeCommand>("container_install");
        codec::register_node::<RunContainerCommand>("container_run");
        codec::register_node::<RemoveImagesCommand>("container_remove_images");
    }
}

/// Agent-side runtime install; package manager work is machine-exclusive.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InstallRuntimeCommand {
    command: Command,
}

impl InstallRuntimeCommand {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CommandNode for InstallRuntimeCommand {
    async fn execute(self: Arc<Self>) {
        let result = machine_exclusive(async {
            os_exec(
                &self.command,
                "",
                "apt: ",
                "/bin/bash",
                &[
                    "-c".to_string(),
                    "apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq docker.io".to_string(),
                ],
            )
            .await
        })
        .await;
        if let Err(fault) = result {
            self.command.err(fault.prefixed("could not install the container runtime: "));
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Agent-side container replacement: pull (once per process), drop the old
/// container, start the new one.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunContainerCommand {
    command: Command,
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_command: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl RunContainerCommand {
    pub fn new(
        name: String,
        image: String,
        run_command: Option<String>,
        options: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            name,
            image,
            run_command,
            options,
        })
    }
}

#[async_trait]
impl CommandNode for RunContainerCommand {
    async fn execute(self: Arc<Self>) {
        let image = self.image.clone();
        let owner = &self.command;
        let pulled = services::pull_once(&self.image, || async {
            os_exec(
                owner,
                "",
                "pull: ",
                "docker",
                &["pull".to_string(), image.clone()],
            )
            .await
            .map_err(anyhow::Error::msg)
        })
        .await;
        match pulled {
            Ok(false) => self.command.log(format!("{} already pulled", self.image)),
            Ok(true) => {}
            Err(err) => {
                self.command.err(format!("could not pull {}: {err:#}", self.image));
                return;
            }
        }

        // a leftover container with the same name blocks docker run
        let _ = OsCommand::new("docker")
            .args(["rm", "-f", &self.name])
            .output()
            .await;

        let mut run_args = vec!["run".to_string(), "-d".to_string(), "--name".to_string(), self.name.clone()];
        run_args.extend(self.options.iter().cloned());
        run_args.push(self.image.clone());
        if let Some(command) = &self.run_command {
            run_args.extend(command.split_whitespace().map(str::to_string));
        }
        if let Err(fault) = os_exec(&self.command, "", "run: ", "docker", &run_args).await {
            self.command
                .err(fault.prefixed(&format!("could not run container {}: ", self.name)));
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Agent-side cleanup of registry-shipped images nothing references anymore.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RemoveImagesCommand {
    command: Command,
    pub references: Vec<String>,
}

impl RemoveImagesCommand {
    pub fn new(references: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            references,
        })
    }
}

#[async_trait]
impl CommandNode for RemoveImagesCommand {
    async fn execute(self: Arc<Self>) {
        for reference in &self.references {
            let output = OsCommand::new("docker").args(["rmi", reference]).output().await;
            match output {
                Ok(output) if output.status.success() => {
                    self.command.log(format!("removed {reference}"));
                }
                Ok(output) => {
                    // usually still referenced by a stopped container; not fatal
                    self.command.log(format!(
                        "could not remove {reference}: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ));
                }
                Err(err) => {
                    self.command.err(format!("could not run docker rmi: {err}"));
                    return;
                }
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

/// Local node: brings the process-wide registry up (first caller wins) and
/// exposes it to the resource through a reverse tunnel. Its children are the
/// per-image push commands, which therefore wait for the registry.
pub struct StartRegistryCommand {
    command: Command,
    connection: Arc<dyn Connection>,
}

impl StartRegistryCommand {
    pub fn new(connection: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            connection,
        })
    }
}

#[async_trait]
impl CommandNode for StartRegistryCommand {
    async fn execute(self: Arc<Self>) {
        let port = match services::local_registry_port().await {
            Ok(port) => port,
            Err(err) => {
                self.command.err(format!("could not start the image registry: {err:#}"));
                return;
            }
        };
        self.command.log(format!("image registry listening on 127.0.0.1:{port}"));
        match self
            .connection
            .start_tunnel(port, REGISTRY_REMOTE_PORT, "", true)
            .await
        {
            Ok(_) => self.command.log(format!(
                "registry exposed to the host on 127.0.0.1:{REGISTRY_REMOTE_PORT}"
            )),
            Err(err) => self
                .command
                .err(format!("could not expose the registry to the host: {err:#}")),
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Local node: tags and pushes one image into the shared registry, once per
/// process no matter how many resources need it.
pub struct PushImageCommand {
    command: Command,
    image: String,
}

impl PushImageCommand {
    pub fn new(image: String) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            image,
        })
    }
}

#[async_trait]
impl CommandNode for PushImageCommand {
    async fn execute(self: Arc<Self>) {
        let port = match services::local_registry_port().await {
            Ok(port) => port,
            Err(err) => {
                self.command.err(format!("registry unavailable: {err:#}"));
                return;
            }
        };
        let push_ref = format!("127.0.0.1:{port}/{}", self.image);
        let owner = &self.command;
        let image = self.image.clone();
        let result = services::push_once(&self.image, || async {
            os_exec(
                owner,
                "",
                "push: ",
                "/bin/bash",
                &[
                    "-c".to_string(),
                    format!("docker tag {image} {push_ref} && docker push {push_ref}"),
                ],
            )
            .await
            .map_err(anyhow::Error::msg)
        })
        .await;
        match result {
            Ok(true) => self.command.log(format!("pushed {}", self.image)),
            Ok(false) => self.command.log(format!("{} already pushed by another resource", self.image)),
            Err(err) => self.command.err(format!("could not push {}: {err:#}", self.image)),
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

    fn running(name: &str, image: &str) -> ContainerInfo {
        ContainerInfo {
            name: name.to_string(),
            image: image.to_string(),
            state: "running".to_string(),
        }
    }

    #[test]
    fn matching_running_container_needs_nothing() {
        let containers = vec![running("web", "localhost:52929/app:latest")];
        assert!(container_up_to_date(
            "web",
            "localhost:52929/app:latest",
            &containers
        ));
    }

    #[test]
    fn stopped_or_renamed_containers_are_replaced() {
        let mut stopped = running("web", "app:latest");
        stopped.state = "exited".to_string();
        assert!(!container_up_to_date("web", "app:latest", &[stopped]));
        assert!(!container_up_to_date(
            "web",
            "app:latest",
            &[running("other", "app:latest")]
        ));
        assert!(!container_up_to_date(
            "web",
            "app:v2",
            &[running("web", "app:v1")]
        ));
    }

    #[test]
    fn push_is_skipped_when_host_has_the_image() {
        let remote = vec![ImageInfo {
            reference: "localhost:52929/app:latest".to_string(),
            id: "sha256:abc".to_string(),
        }];
        assert!(!image_push_needed(
            "sha256:abc",
            "localhost:52929/app:latest",
            &remote
        ));
        assert!(image_push_needed(
            "sha256:def",
            "localhost:52929/app:latest",
            &remote
        ));
        assert!(image_push_needed("sha256:abc", "localhost:52929/app:latest", &[]));
    }
}
