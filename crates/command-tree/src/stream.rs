use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::codec::{self, CodecError};
use crate::command::{CommandId, CommandNode, CommandState};
use crate::commands::MirrorCommand;
use crate::fault::Fault;
use crate::monitor::{monitor_channel, MonitorEvent};
use crate::runner::Runner;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("remote execution failed: {0}")]
    Remote(String),
}

/// First payload of every session: the shipped sub-tree plus the worker count
/// the receiving runner should use.
#[derive(Serialize, Deserialize)]
struct StreamCommand {
    root: serde_json::Value,
    threads: usize,
}

/// Receiving half of the bridge: reads one framed [`StreamCommand`], runs the
/// shipped tree and writes every monitor event back as a frame. Returns when
/// the run finished and all events are flushed.
pub async fn stream_receive<R, W>(mut input: R, mut output: W) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let payload = codec::read_frame(&mut input)
        .await?
        .ok_or_else(|| StreamError::Protocol("stream closed before a command arrived".into()))?;
    let wire: StreamCommand = serde_json::from_slice(&payload).map_err(CodecError::from)?;
    let root = codec::decode_node(wire.root)?;

    let (tx, mut rx) = monitor_channel();
    let runner = Runner::new(root, wire.threads);
    let mut run = tokio::spawn(async move {
        runner.run(Some(tx)).await;
    });

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                write_event(&mut output, &event).await?;
            }
            _ = &mut run => {
                // no producer is left once the runner returned; drain and stop
                while let Ok(event) = rx.try_recv() {
                    write_event(&mut output, &event).await?;
                }
                break;
            }
        }
    }
    Ok(())
}

async fn write_event<W: AsyncWrite + Unpin>(
    output: &mut W,
    event: &MonitorEvent,
) -> Result<(), StreamError> {
    let payload = serde_json::to_vec(event).map_err(CodecError::from)?;
    codec::write_frame(output, &payload).await?;
    Ok(())
}

/// Sending half of the bridge: ships `root` to a peer and re-materializes the
/// remote tree as mirror nodes under `attach`. Returns once the peer's event
/// stream ends; any mirror still unfinished at that point (or peer output on
/// stderr) turns into a synthesized failure on every unfinished mirror.
pub async fn stream_call<R, E, W, L>(
    root: Arc<dyn CommandNode>,
    attach: Arc<dyn CommandNode>,
    threads: usize,
    mut input: R,
    mut error_input: E,
    mut output: W,
    log: L,
) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    L: Fn(String),
{
    let encoded = codec::encode_node(root.as_ref())?;
    let payload =
        serde_json::to_vec(&StreamCommand { root: encoded, threads }).map_err(CodecError::from)?;
    codec::write_frame(&mut output, &payload).await?;

    let mut mirror = MirrorTree::new(attach);
    loop {
        match codec::read_frame(&mut input).await {
            Ok(Some(payload)) => {
                let event: MonitorEvent = match serde_json::from_slice(&payload) {
                    Ok(event) => event,
                    Err(err) => {
                        let stderr = drain(&mut error_input).await;
                        let fault = stream_fault(format!("undecodable event: {err}"), &stderr);
                        mirror.fail(&fault);
                        return Err(StreamError::Remote(fault.to_string()));
                    }
                };
                if let Err(err) = mirror.apply(event, &log) {
                    let fault = Fault::new(err.to_string());
                    mirror.fail(&fault);
                    return Err(err);
                }
            }
            Ok(None) => break,
            Err(err) => {
                let stderr = drain(&mut error_input).await;
                let fault = stream_fault(format!("error in event stream: {err}"), &stderr);
                mirror.fail(&fault);
                return Err(StreamError::Remote(fault.to_string()));
            }
        }
    }

    let stderr = drain(&mut error_input).await;
    if !stderr.trim().is_empty() {
        let fault = stream_fault("remote command wrote to stderr".to_string(), &stderr);
        mirror.fail(&fault);
        return Err(StreamError::Remote(fault.to_string()));
    }
    if !mirror.all_completed() {
        let fault = Fault::new("one or more commands did not complete on the remote system");
        mirror.fail(&fault);
        return Err(StreamError::Remote(fault.to_string()));
    }
    Ok(())
}

fn stream_fault(message: String, stderr: &str) -> Fault {
    let fault = Fault::new(message);
    if stderr.trim().is_empty() {
        fault
    } else {
        fault.with_data("stderr", stderr.trim())
    }
}

async fn drain<E: AsyncRead + Unpin>(reader: &mut E) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Remote-id keyed table of local mirror nodes. The mirror owns its own
/// children; the only tie to the remote tree is this table. The shipped root
/// is kept detached, and `attach` is substituted wherever it appears as a
/// parent.
struct MirrorTree {
    attach: Arc<dyn CommandNode>,
    nodes: HashMap<CommandId, Arc<MirrorCommand>>,
    remote_root: Option<CommandId>,
}

impl MirrorTree {
    fn new(attach: Arc<dyn CommandNode>) -> Self {
        Self {
            attach,
            nodes: HashMap::new(),
            remote_root: None,
        }
    }

    fn node(&self, id: CommandId) -> Result<&Arc<MirrorCommand>, StreamError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| StreamError::Protocol(format!("event for unknown node {id}")))
    }

    fn apply<L: Fn(String)>(&mut self, event: MonitorEvent, log: &L) -> Result<(), StreamError> {
        match event {
            MonitorEvent::ChildAdded { parent, id, caption } => {
                if self.nodes.contains_key(&id) {
                    return Err(StreamError::Protocol(format!("node {id} announced twice")));
                }
                let node = MirrorCommand::new(caption.clone());
                match parent {
                    None => {
                        if self.remote_root.is_some() {
                            return Err(StreamError::Protocol("second root announced".into()));
                        }
                        self.remote_root = Some(id);
                    }
                    Some(parent_id) => {
                        let parent_cmd = if Some(parent_id) == self.remote_root {
                            self.attach.as_command()
                        } else {
                            self.node(parent_id)?.as_command()
                        };
                        parent_cmd.add(caption, node.clone());
                    }
                }
                self.nodes.insert(id, node);
            }
            MonitorEvent::StateChange { id, state } => {
                self.node(id)?.as_command().set_state(state);
            }
            MonitorEvent::Log { id, entry } => {
                self.node(id)?.as_command().append_entry(entry);
            }
            MonitorEvent::Result { id, value } => {
                self.node(id)?.as_command().set_result(value);
            }
            MonitorEvent::Panic { message } => {
                log(format!("remote panic: {message}"));
            }
        }
        Ok(())
    }

    fn all_completed(&self) -> bool {
        self.nodes
            .values()
            .all(|node| node.as_command().state() == CommandState::Completed)
    }

    /// Forces every unfinished mirror to Completed with `fault` recorded.
    fn fail(&self, fault: &Fault) {
        for node in self.nodes.values() {
            let cmd = node.as_command();
            if cmd.state() != CommandState::Completed {
                cmd.err(fault.clone());
                cmd.set_state(CommandState::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{register_node, register_value, DynValue};
    use crate::command::LogEntry;
    use crate::commands::{ExecCommand, RootCommand, ShellCommands};

    fn register_stream_types() {
        register_node::<RootCommand>("root");
        register_node::<ExecCommand>("exec");
        register_node::<ShellCommands>("shell");
        register_value::<StreamTestResult>("stream_test_result");
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct StreamTestResult {
        answer: u32,
    }

    #[tokio::test]
    async fn mirror_replay_reconstructs_the_tree() {
        register_stream_types();
        let attach = RootCommand::new("attach");
        let attach_node: Arc<dyn CommandNode> = attach.clone();

        // hand-built event stream for a root with one child
        let events = vec![
            MonitorEvent::ChildAdded {
                parent: None,
                id: 1000,
                caption: "remote root".into(),
            },
            MonitorEvent::ChildAdded {
                parent: Some(1000),
                id: 1001,
                caption: "work".into(),
            },
            MonitorEvent::StateChange {
                id: 1001,
                state: CommandState::Running,
            },
            MonitorEvent::Log {
                id: 1001,
                entry: LogEntry::message("hi there"),
            },
            MonitorEvent::Result {
                id: 1001,
                value: DynValue::new(StreamTestResult { answer: 42 }),
            },
            MonitorEvent::StateChange {
                id: 1001,
                state: CommandState::Completed,
            },
            MonitorEvent::StateChange {
                id: 1000,
                state: CommandState::Completed,
            },
        ];

        let mut mirror = MirrorTree::new(attach_node);
        for event in events {
            mirror.apply(event, &|_| {}).expect("apply event");
        }
        assert!(mirror.all_completed());

        let children = attach.as_command().children();
        assert_eq!(children.len(), 1);
        let work = children[0].as_command();
        assert_eq!(work.caption(), "work");
        assert!(work.remote());
        assert_eq!(work.state(), CommandState::Completed);
        assert_eq!(work.entries()[0].message.as_deref(), Some("hi there"));
        let result = work.result().expect("result");
        assert_eq!(
            result.downcast_ref::<StreamTestResult>(),
            Some(&StreamTestResult { answer: 42 })
        );
    }

    #[tokio::test]
    async fn unfinished_mirrors_fail_on_eof() {
        register_stream_types();
        let attach = RootCommand::new("attach");
        let attach_node: Arc<dyn CommandNode> = attach.clone();
        let mut mirror = MirrorTree::new(attach_node);
        mirror
            .apply(
                MonitorEvent::ChildAdded {
                    parent: None,
                    id: 7,
                    caption: "root".into(),
                },
                &|_| {},
            )
            .expect("apply");
        mirror
            .apply(
                MonitorEvent::ChildAdded {
                    parent: Some(7),
                    id: 8,
                    caption: "stuck".into(),
                },
                &|_| {},
            )
            .expect("apply");
        assert!(!mirror.all_completed());

        mirror.fail(&Fault::new("stream ended early"));
        let stuck = &attach.as_command().children()[0];
        assert_eq!(stuck.as_command().state(), CommandState::Completed);
        assert!(stuck.as_command().any_error());
    }

    #[tokio::test]
    async fn echo_roundtrip_through_in_memory_pipe() {
        register_stream_types();

        let root = RootCommand::new("remote work");
        let echo = root.as_command().add(
            "print",
            ExecCommand::new("", None, "", "echo", vec!["hi there".to_string()]),
        );
        echo.as_command().add(
            "hostname below",
            ExecCommand::new("", None, "", "hostname", vec![]),
        );

        // caller -> receiver and receiver -> caller byte pipes
        let (call_tx, receive_rx) = tokio::io::duplex(64 * 1024);
        let (receive_tx, call_rx) = tokio::io::duplex(64 * 1024);

        let receiver = tokio::spawn(async move {
            let (read_half, _unused) = tokio::io::split(receive_rx);
            let (_unused2, write_half) = tokio::io::split(receive_tx);
            stream_receive(read_half, write_half).await
        });

        let attach = RootCommand::new("local attach");
        let attach_node: Arc<dyn CommandNode> = attach.clone();
        let (read_half, _u) = tokio::io::split(call_rx);
        let (_u2, write_half) = tokio::io::split(call_tx);
        stream_call(
            root.clone(),
            attach_node,
            2,
            read_half,
            tokio::io::empty(),
            write_half,
            |_| {},
        )
        .await
        .expect("stream call");
        receiver.await.expect("join").expect("stream receive");

        let mirrored = attach.as_command().children();
        assert_eq!(mirrored.len(), 1);
        let print = mirrored[0].as_command();
        assert_eq!(print.caption(), "print");
        assert_eq!(print.state(), CommandState::Completed);
        assert_eq!(print.entries()[0].message.as_deref(), Some("hi there"));

        let nested = mirrored[0].as_command().children();
        assert_eq!(nested.len(), 1);
        let host = nested[0].as_command();
        assert_eq!(host.state(), CommandState::Completed);
        let hostname = std::process::Command::new("hostname")
            .output()
            .expect("hostname");
        let expected = String::from_utf8_lossy(&hostname.stdout).trim().to_string();
        assert_eq!(host.entries()[0].message.as_deref(), Some(expected.as_str()));
    }
}
