//! End-to-end bridge tests over an in-memory byte pipe: a shipped tree runs
//! on the receiving side and the caller's mirror must match it.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use command_tree::codec::{register_node, register_value};
use command_tree::{
    stream_call, stream_receive, Command, CommandNode, CommandState, DynValue, ExecCommand,
    RootCommand,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Probe {
    hostname: String,
}

/// Logs, errors or returns a result depending on its configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ProbeCommand {
    command: Command,
    fail: bool,
    result: Option<String>,
}

impl ProbeCommand {
    fn new(fail: bool, result: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            fail,
            result: result.map(str::to_string),
        })
    }
}

#[async_trait]
impl CommandNode for ProbeCommand {
    async fn execute(self: Arc<Self>) {
        self.command.log("probe ran");
        if self.fail {
            self.command.err("probe failed");
        }
        if let Some(result) = &self.result {
            self.command.set_result(DynValue::new(Probe {
                hostname: result.clone(),
            }));
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn register() {
    register_node::<RootCommand>("root");
    register_node::<ExecCommand>("exec");
    register_node::<ProbeCommand>("probe");
    register_value::<Probe>("probe_result");
}

async fn bridge(
    root: Arc<dyn CommandNode>,
    attach: Arc<dyn CommandNode>,
) -> Result<(), command_tree::StreamError> {
    let (call_tx, receive_rx) = tokio::io::duplex(64 * 1024);
    let (receive_tx, call_rx) = tokio::io::duplex(64 * 1024);
    let receiver = tokio::spawn(async move {
        let (input, _keep_rx) = tokio::io::split(receive_rx);
        let (_keep_tx, output) = tokio::io::split(receive_tx);
        stream_receive(input, output).await
    });

    let (input, _keep_call_rx) = tokio::io::split(call_rx);
    let (_keep_call_tx, output) = tokio::io::split(call_tx);
    let result = stream_call(root, attach, 2, input, tokio::io::empty(), output, |_| {}).await;
    receiver.await.expect("receiver join").expect("receiver");
    result
}

#[tokio::test]
async fn mirror_matches_the_remote_run() {
    register();
    let root = RootCommand::new("work");
    let probe = root.as_command().add("probe", ProbeCommand::new(false, Some("web1")));
    probe
        .as_command()
        .add("nested", ProbeCommand::new(false, None));

    let attach = RootCommand::new("attach");
    bridge(root, attach.clone()).await.expect("bridge");

    let mirrored = attach.as_command().children();
    assert_eq!(mirrored.len(), 1);
    let probe_mirror = mirrored[0].as_command();
    assert_eq!(probe_mirror.caption(), "probe");
    assert!(probe_mirror.remote());
    assert_eq!(probe_mirror.state(), CommandState::Completed);
    assert!(!probe_mirror.any_error());
    assert_eq!(probe_mirror.entries()[0].message.as_deref(), Some("probe ran"));
    let result = probe_mirror.result().expect("result");
    assert_eq!(
        result.downcast_ref::<Probe>(),
        Some(&Probe {
            hostname: "web1".to_string()
        })
    );

    let nested = mirrored[0].as_command().children();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].as_command().state(), CommandState::Completed);
    assert_eq!(
        nested[0].as_command().entries()[0].message.as_deref(),
        Some("probe ran")
    );
}

#[tokio::test]
async fn remote_failure_surfaces_on_the_mirror() {
    register();
    let root = RootCommand::new("work");
    let failing = root.as_command().add("failing", ProbeCommand::new(true, None));
    failing
        .as_command()
        .add("blocked", ProbeCommand::new(false, None));
    root.as_command().add("ok", ProbeCommand::new(false, None));

    let attach = RootCommand::new("attach");
    // the blocked descendant never completes remotely, so the bridge reports
    // the run as failed and force-completes its mirror
    let result = bridge(root, attach.clone()).await;
    assert!(result.is_err());

    let mirrored = attach.as_command().children();
    assert_eq!(mirrored.len(), 2);
    for node in &mirrored {
        assert_eq!(node.as_command().state(), CommandState::Completed);
    }
    let failing_mirror = mirrored
        .iter()
        .find(|n| n.as_command().caption() == "failing")
        .expect("failing mirror");
    assert!(failing_mirror.as_command().any_error());
    let ok_mirror = mirrored
        .iter()
        .find(|n| n.as_command().caption() == "ok")
        .expect("ok mirror");
    assert!(!ok_mirror.as_command().any_error());

    let blocked = failing_mirror.as_command().children();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].as_command().state(), CommandState::Completed);
    assert!(blocked[0].as_command().any_error());
}
