use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use schema::{
    Config, DeploymentHook, Environment, ManagerSet, PackageCommandSpec, PackageModule,
    PackageSpec, Resource, TemplateSource, TunnelSpec,
};
use serde::Deserialize;

use crate::template::SimpleTemplateSource;

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    environment: BTreeMap<String, RawEnvironment>,
    #[serde(default)]
    package: BTreeMap<String, RawPackage>,
}

#[derive(Deserialize)]
struct RawEnvironment {
    #[serde(default)]
    vars: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    decommission_tag: Option<String>,
    #[serde(default)]
    hook: Vec<RawHook>,
    #[serde(default)]
    resource: BTreeMap<String, RawResource>,
    /// Provider name → group name → provider-specific group configuration.
    #[serde(default)]
    group: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct RawHook {
    when: String,
    package: String,
    command: String,
}

#[derive(Deserialize)]
struct RawResource {
    manager: String,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
    /// Provider-specific fields, passed through to the resource manager.
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawPackage {
    #[serde(default)]
    tunnel: BTreeMap<String, RawTunnel>,
    #[serde(default)]
    command: BTreeMap<String, RawCommand>,
    /// Module name → configured instances.
    #[serde(default)]
    module: BTreeMap<String, Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct RawTunnel {
    port: u16,
    #[serde(default)]
    host: String,
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(default)]
    local: bool,
    #[serde(default)]
    tunnels: Vec<String>,
    commands: Vec<String>,
    #[serde(default)]
    target: String,
}

pub async fn load(path: &Path, managers: &ManagerSet) -> anyhow::Result<Arc<Config>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse(&text, managers).with_context(|| format!("failed to parse config {}", path.display()))
}

pub fn parse(text: &str, managers: &ManagerSet) -> anyhow::Result<Arc<Config>> {
    let raw: RawConfig = toml::from_str(text)?;
    let template_source = Arc::new(SimpleTemplateSource::new());

    let mut packages = BTreeMap::new();
    for (package_name, raw_package) in raw.package {
        let mut tunnels = BTreeMap::new();
        for (tunnel_name, raw_tunnel) in raw_package.tunnel {
            tunnels.insert(
                tunnel_name.clone(),
                TunnelSpec {
                    port: raw_tunnel.port,
                    host: template_source.new_template(
                        &format!("package.{package_name}.tunnel.{tunnel_name}.host"),
                        &raw_tunnel.host,
                    )?,
                },
            );
        }
        let mut commands = BTreeMap::new();
        for (command_name, raw_command) in raw_package.command {
            let location = format!("package.{package_name}.command.{command_name}");
            commands.insert(
                command_name.clone(),
                Arc::new(PackageCommandSpec {
                    local: raw_command.local,
                    tunnels: raw_command.tunnels,
                    commands: raw_command
                        .commands
                        .iter()
                        .map(|text| template_source.new_template(&location, text))
                        .collect::<anyhow::Result<Vec<_>>>()?,
                    target: template_source
                        .new_template(&format!("{location}.target"), &raw_command.target)?,
                }),
            );
        }
        let mut modules = Vec::new();
        for (module_name, configs) in raw_package.module {
            if !managers.modules.contains_key(module_name.as_str()) {
                anyhow::bail!("package {package_name:?} references unknown module {module_name:?}");
            }
            for config in configs {
                modules.push(PackageModule {
                    module: module_name.clone(),
                    config,
                });
            }
        }
        packages.insert(
            package_name.clone(),
            Arc::new(PackageSpec {
                name: package_name,
                tunnels,
                commands,
                modules,
            }),
        );
    }

    let mut environments = BTreeMap::new();
    for (environment_name, raw_environment) in raw.environment {
        let mut resources = BTreeMap::new();
        let mut by_package: BTreeMap<String, Vec<Arc<Resource>>> = BTreeMap::new();
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (manager_name, manager_groups) in &raw_environment.group {
            groups.insert(manager_name.clone(), manager_groups.keys().cloned().collect());
        }

        for (resource_name, raw_resource) in raw_environment.resource {
            let manager = managers
                .resources
                .get(raw_resource.manager.as_str())
                .with_context(|| {
                    format!(
                        "resource {resource_name:?} references unknown manager {:?}",
                        raw_resource.manager
                    )
                })?;
            let value = manager
                .parse_resource(&serde_json::Value::Object(raw_resource.rest.clone()))
                .with_context(|| format!("resource {resource_name:?}"))?;

            let mut resource = Resource::new(resource_name.clone(), Arc::clone(manager), value);
            if let Some(group_name) = raw_resource.group {
                let group_config = raw_environment
                    .group
                    .get(&raw_resource.manager)
                    .and_then(|g| g.get(&group_name))
                    .with_context(|| {
                        format!("resource {resource_name:?} references unknown group {group_name:?}")
                    })?;
                resource.group_value = Some(manager.parse_group(group_config)?);
                resource.group = Some(group_name);
            }

            for package_name in &raw_resource.packages {
                let package = packages.get(package_name).with_context(|| {
                    format!("resource {resource_name:?} references unknown package {package_name:?}")
                })?;
                resource.packages.insert(package_name.clone());
                for module in &package.modules {
                    let manager = &managers.modules[module.module.as_str()];
                    let instance = manager.parse_instance(&module.config).with_context(|| {
                        format!("package {package_name:?} module {:?}", module.module)
                    })?;
                    resource
                        .modules
                        .entry(module.module.clone())
                        .or_default()
                        .push(instance);
                }
            }

            resource.set_attribute("name", serde_json::Value::String(resource_name.clone()));
            for (key, value) in &raw_resource.rest {
                resource.set_attribute(key.clone(), value.clone());
            }
            for (key, value) in raw_resource.attributes {
                resource.set_attribute(key, value);
            }

            let resource = Arc::new(resource);
            for package_name in &resource.packages {
                by_package
                    .entry(package_name.clone())
                    .or_default()
                    .push(Arc::clone(&resource));
            }
            resources.insert(resource_name, resource);
        }

        let mut hooks = Vec::new();
        for raw_hook in raw_environment.hook {
            let before = match raw_hook.when.as_str() {
                "before" => true,
                "after" => false,
                other => anyhow::bail!("hook `when` must be \"before\" or \"after\", got {other:?}"),
            };
            let package = packages.get(&raw_hook.package).with_context(|| {
                format!("hook references unknown package {:?}", raw_hook.package)
            })?;
            let command = package.commands.get(&raw_hook.command).with_context(|| {
                format!(
                    "hook references unknown command {:?} in package {:?}",
                    raw_hook.command, raw_hook.package
                )
            })?;
            hooks.push(DeploymentHook {
                before,
                package: raw_hook.package,
                command_name: raw_hook.command,
                command: Arc::clone(command),
            });
        }

        environments.insert(
            environment_name.clone(),
            Arc::new(Environment {
                decommission_tag: raw_environment
                    .decommission_tag
                    .unwrap_or_else(|| format!("convoy-{environment_name}")),
                name: environment_name,
                vars: raw_environment.vars,
                groups,
                resources,
                resources_by_package: by_package,
                hooks,
            }),
        );
    }

    Ok(Arc::new(Config {
        environments,
        packages,
        template_source,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[environment.staging]
decommission_tag = "convoy-staging"

[environment.staging.vars]
domain = "staging.example.com"

[[environment.staging.hook]]
when = "before"
package = "web"
command = "announce"

[environment.staging.resource.web1]
manager = "server"
packages = ["web"]
host = "10.0.0.4"
username = "deploy"

[environment.staging.resource.web1.attributes]
role = "frontend"

[package.web]

[package.web.tunnel.db]
port = 5432
host = ""

[package.web.command.announce]
local = true
commands = ["echo deploying {{ vars.domain }}"]
target = "*"

[[package.web.module.file]]
remote_path = "/etc/motd"
source = "files/motd"
"#;

    #[test]
    fn sample_config_parses() {
        let config = parse(SAMPLE, registry::builtin()).expect("parse");
        let environment = config.environments.get("staging").expect("environment");
        assert_eq!(environment.decommission_tag, "convoy-staging");
        assert_eq!(environment.hooks.len(), 1);
        assert!(environment.hooks[0].before);

        let resource = environment.resources.get("web1").expect("resource");
        assert_eq!(resource.manager.name(), "server");
        assert!(resource.packages.contains("web"));
        assert_eq!(resource.modules.get("file").map(Vec::len), Some(1));
        let attributes = resource.attributes();
        assert_eq!(
            attributes.get("role"),
            Some(&serde_json::Value::String("frontend".to_string()))
        );
        assert_eq!(
            attributes.get("host"),
            Some(&serde_json::Value::String("10.0.0.4".to_string()))
        );

        let package = config.packages.get("web").expect("package");
        assert_eq!(package.tunnels.get("db").map(|t| t.port), Some(5432));
    }

    #[test]
    fn unknown_manager_is_rejected() {
        let text = r#"
[environment.e.resource.r]
manager = "not_a_manager"
"#;
        let err = parse(text, registry::builtin()).expect_err("must fail");
        assert!(format!("{err:#}").contains("not_a_manager"));
    }

    #[test]
    fn unknown_module_is_rejected() {
        let text = r#"
[package.p]
[[package.p.module.not_a_module]]
x = 1
"#;
        let err = parse(text, registry::builtin()).expect_err("must fail");
        assert!(format!("{err:#}").contains("not_a_module"));
    }

    #[test]
    fn unknown_hook_command_is_rejected() {
        let text = r#"
[environment.e]
hook = [{ when = "before", package = "p", command = "missing" }]
[package.p]
"#;
        let err = parse(text, registry::builtin()).expect_err("must fail");
        assert!(format!("{err:#}").contains("missing"));
    }
}
