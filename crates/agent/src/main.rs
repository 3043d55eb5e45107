use clap::{Parser, Subcommand};
use command_tree::{codec, stream_receive, DynValue};
use schema::{DefaultStateQuery, AGENT_VERSION};
use tracing_subscriber::EnvFilter;

/// One-shot agent shipped to every managed host. `exec` consumes a framed
/// command tree on stdin and emits monitor events on stdout; stderr carries
/// nothing but diagnostics, because the caller treats stderr output as a
/// failed session.
#[derive(Parser)]
#[command(name = "convoy-agent", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Read a framed command tree from stdin, run it, stream events to stdout.
    Exec,
    /// Print the state of every module that needs no query. Diagnostic only.
    Getstate,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    registry::wire_register();
    let args = Args::parse();

    match args.command {
        None => {
            println!("convoy-agent {AGENT_VERSION}");
        }
        Some(Cmd::Exec) => {
            if let Err(err) = stream_receive(tokio::io::stdin(), tokio::io::stdout()).await {
                eprintln!("exec failed: {err}");
                std::process::exit(1);
            }
        }
        Some(Cmd::Getstate) => {
            if let Err(err) = getstate().await {
                eprintln!("getstate failed: {err:#}");
                std::process::exit(1);
            }
        }
    }
}

async fn getstate() -> anyhow::Result<()> {
    for (name, manager) in &registry::builtin().modules {
        println!("module: {name}");
        if manager.requires_query() {
            println!(" - skipped: this module needs a query object");
            continue;
        }
        match manager
            .get_state(DynValue::new(DefaultStateQuery::default()))
            .await
        {
            Ok(state) => match codec::encode_value(&state) {
                Ok(value) => println!(" - state: {}", serde_json::to_string_pretty(&value)?),
                Err(err) => println!(" - error: collected state but could not serialize it: {err}"),
            },
            Err(err) => println!(" - error: {err:#}"),
        }
    }
    Ok(())
}
