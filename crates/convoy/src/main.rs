use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use convoy::cli::{Args, Cmd};
use convoy::config;
use convoy::deploy::{deploy, resource_scope, AgentSource, DeployOptions};
use convoy::package::{find_command, run_package_command, PackageContext};
use schema::Environment;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    registry::wire_register();

    if let Err(err) = run(Args::parse()).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let managers = Arc::new(registry::builtin().clone());
    let config = config::load(&args.config, &managers).await?;

    match args.command {
        Cmd::Deploy {
            environment,
            allow_decommission,
        } => {
            let environment = lookup_environment(&config.environments, &environment)?;
            let ok = deploy(
                Arc::clone(&config),
                environment,
                managers,
                DeployOptions {
                    workers: args.workers,
                    allow_decommission,
                    agent_bin: args.agent_bin,
                },
            )
            .await?;
            if !ok {
                anyhow::bail!("deployment finished with errors");
            }
        }
        Cmd::Run {
            environment,
            command,
            target,
            args: extra_args,
        } => {
            let environment = lookup_environment(&config.environments, &environment)?;
            let (package, spec) = find_command(&config, &command)
                .with_context(|| format!("no package declares a command named {command:?}"))?;
            set_template_globals(&config, &environment);
            let ctx = PackageContext {
                config: Arc::clone(&config),
                environment,
                managers,
                agent: Arc::new(AgentSource::resolve(args.agent_bin)),
                workers: args.workers,
            };
            let ok = run_package_command(
                &ctx,
                &command,
                &spec,
                &package,
                target.as_deref(),
                &extra_args,
            )
            .await?;
            if !ok {
                anyhow::bail!("command finished with errors");
            }
        }
        Cmd::Ssh {
            environment,
            resource,
        } => {
            let environment = lookup_environment(&config.environments, &environment)?;
            set_template_globals(&config, &environment);
            let resource = environment
                .resources
                .get(&resource)
                .with_context(|| format!("no resource named {resource:?}"))?;
            let server = resource
                .value
                .as_server()
                .with_context(|| format!("{} is not a server resource", resource.name))?;
            let connection = server.open_connection().await?;
            let result = connection.shell(None, 0, 0).await;
            let _ = connection.close().await;
            result?;
        }
        Cmd::Tunnel {
            environment,
            tunnel,
            resource,
        } => {
            let environment = lookup_environment(&config.environments, &environment)?;
            set_template_globals(&config, &environment);
            open_tunnel(&config, &environment, &tunnel, resource.as_deref()).await?;
        }
    }
    Ok(())
}

fn lookup_environment(
    environments: &std::collections::BTreeMap<String, Arc<Environment>>,
    name: &str,
) -> anyhow::Result<Arc<Environment>> {
    environments
        .get(name)
        .cloned()
        .with_context(|| format!("no environment named {name:?}"))
}

fn set_template_globals(config: &schema::Config, environment: &Environment) {
    config.template_source.add_global(
        "vars",
        serde_json::Value::Object(environment.vars.clone().into_iter().collect()),
    );
    config.template_source.add_global(
        "environment",
        serde_json::Value::String(environment.name.clone()),
    );
}

async fn open_tunnel(
    config: &schema::Config,
    environment: &Arc<Environment>,
    tunnel_name: &str,
    resource_name: Option<&str>,
) -> anyhow::Result<()> {
    // find the package declaring the tunnel and a server carrying it
    for (package_name, package) in &config.packages {
        let Some(tunnel) = package.tunnels.get(tunnel_name) else {
            continue;
        };
        let resources = environment
            .resources_by_package
            .get(package_name)
            .cloned()
            .unwrap_or_default();
        let resource = resources
            .into_iter()
            .find(|resource| {
                resource.value.as_server().is_some()
                    && resource_name.map_or(true, |name| resource.name == name)
            })
            .with_context(|| {
                format!("no matching server in {} carries tunnel {tunnel_name:?}", environment.name)
            })?;

        let server = resource.value.as_server().context("not a server resource")?;
        let connection = server.open_connection().await?;
        let host = tunnel.host.render(&resource_scope(&resource))?;
        let port = connection.start_tunnel(0, tunnel.port, &host, false).await?;
        println!(
            "tunnel {tunnel_name} to {}:{} open on 127.0.0.1:{port}; ctrl-c to close",
            resource.name, tunnel.port
        );
        tokio::signal::ctrl_c().await?;
        let _ = connection.close().await;
        return Ok(());
    }
    anyhow::bail!("no package declares a tunnel named {tunnel_name:?}")
}
