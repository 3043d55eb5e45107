use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, CommandId, CommandNode, CommandState};
use crate::fault::Fault;
use crate::monitor::{MonitorEvent, MonitorSender};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Walks a command tree with a pool of workers, starting children only after
/// their parent finished without errors. Remote-flagged nodes are mirrors of
/// work happening elsewhere and are never scheduled locally.
pub struct Runner {
    root: Arc<dyn CommandNode>,
    threads: usize,
}

struct Shared {
    work_tx: mpsc::UnboundedSender<Arc<dyn CommandNode>>,
    monitor: Option<MonitorSender>,
    announced: Mutex<HashSet<CommandId>>,
    cancel: CancellationToken,
}

impl Shared {
    /// Announces a node to the monitor the first time it is observed.
    fn announce(&self, parent: Option<CommandId>, cmd: &Command) {
        let mut seen = self
            .announced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if seen.insert(cmd.id()) {
            if let Some(monitor) = &self.monitor {
                let _ = monitor.send(MonitorEvent::ChildAdded {
                    parent,
                    id: cmd.id(),
                    caption: cmd.caption(),
                });
            }
        }
    }

    fn emit(&self, event: MonitorEvent) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(event);
        }
    }
}

impl Runner {
    pub fn new(root: Arc<dyn CommandNode>, threads: usize) -> Self {
        Self {
            root,
            threads: threads.max(1),
        }
    }

    /// Runs the tree to completion and returns true when no node recorded an
    /// error. An error on a node keeps its descendants from starting but does
    /// not abort siblings.
    pub async fn run(&self, monitor: Option<MonitorSender>) -> bool {
        let (work_tx, work_rx) = mpsc::unbounded_channel::<Arc<dyn CommandNode>>();
        let shared = Arc::new(Shared {
            work_tx,
            monitor,
            announced: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        });
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.threads {
            let shared = Arc::clone(&shared);
            let work_rx = Arc::clone(&work_rx);
            workers.spawn(async move {
                loop {
                    let node = {
                        let mut rx = work_rx.lock().await;
                        tokio::select! {
                            _ = shared.cancel.cancelled() => None,
                            node = rx.recv() => node,
                        }
                    };
                    let Some(node) = node else { break };
                    run_node(node, &shared).await;
                }
            });
        }

        // the coordinator: registers new nodes, enqueues startable ones and
        // detects termination. Polling is what makes children added during
        // execute visible.
        let no_error = loop {
            let (done, no_error) = scan(&self.root, true, None, &shared);
            if done {
                break no_error;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        shared.cancel.cancel();
        while workers.join_next().await.is_some() {}
        no_error
    }
}

async fn run_node(node: Arc<dyn CommandNode>, shared: &Shared) {
    let cmd = node.as_command();
    if cmd.begin_run(shared.monitor.clone()) {
        let outcome = AssertUnwindSafe(Arc::clone(&node).execute())
            .catch_unwind()
            .await;
        let cmd = node.as_command();
        if let Err(payload) = outcome {
            let text = panic_text(payload.as_ref());
            cmd.err(Fault::new(format!("panic during execute: {text}")));
            shared.emit(MonitorEvent::Panic { message: text });
        }
        cmd.finish_run();
    }

    // start children this node just made eligible; the coordinator would find
    // them too, this only shortens the latency
    let cmd = node.as_command();
    if cmd.state() == CommandState::Completed && !cmd.any_error() {
        for child in cmd.children() {
            let child_cmd = child.as_command();
            if child_cmd.state() == CommandState::Ready && !child_cmd.remote() {
                shared.announce(Some(cmd.id()), child_cmd);
                let _ = shared.work_tx.send(Arc::clone(&child));
            }
        }
    }
}

fn scan(
    node: &Arc<dyn CommandNode>,
    startable: bool,
    parent: Option<CommandId>,
    shared: &Shared,
) -> (bool, bool) {
    let cmd = node.as_command();
    let state = cmd.state();
    let mut done = matches!(state, CommandState::Completed | CommandState::Paused);
    let mut no_error = !cmd.any_error();

    shared.announce(parent, cmd);

    if startable && state == CommandState::Ready && !cmd.remote() {
        let _ = shared.work_tx.send(Arc::clone(node));
    }

    for child in cmd.children() {
        let children_startable = startable
            && matches!(
                cmd.state(),
                CommandState::Completed | CommandState::Paused
            )
            && !cmd.any_error();
        let (child_done, child_no_error) = scan(&child, children_startable, Some(cmd.id()), shared);
        done = (child_done || !children_startable) && done;
        no_error = child_no_error && no_error;
    }

    (done, no_error)
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
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
    use crate::commands::{ClosureCommand, RootCommand};
    use crate::monitor::monitor_channel;

    fn logging_node(message: &'static str) -> Arc<ClosureCommand> {
        ClosureCommand::new(move |cmd| async move {
            cmd.log(message);
        })
    }

    fn failing_node(message: &'static str) -> Arc<ClosureCommand> {
        ClosureCommand::new(move |cmd| async move {
            cmd.err(message);
        })
    }

    #[tokio::test]
    async fn all_nodes_complete_on_success() {
        let root = RootCommand::new("run");
        let a = root.as_command().add("a", logging_node("a done"));
        let b = a.as_command().add("b", logging_node("b done"));
        let runner = Runner::new(root.clone(), 3);
        assert!(runner.run(None).await);
        assert_eq!(root.as_command().state(), CommandState::Completed);
        assert_eq!(a.as_command().state(), CommandState::Completed);
        assert_eq!(b.as_command().state(), CommandState::Completed);
    }

    #[tokio::test]
    async fn error_blocks_descendants_but_not_siblings() {
        let root = RootCommand::new("run");
        let failing = failing_node("this is my error");
        let blocked = failing.as_command().add("blocked", logging_node("never"));
        root.as_command().add("failing", failing.clone());
        let ok = root.as_command().add("ok", logging_node("ok"));

        let runner = Runner::new(root.clone(), 2);
        assert!(!runner.run(None).await);

        assert_eq!(failing.as_command().state(), CommandState::Completed);
        assert!(failing.as_command().any_error());
        assert_eq!(ok.as_command().state(), CommandState::Completed);
        assert!(!ok.as_command().any_error());
        // the descendant of the failed node never started
        assert_eq!(blocked.as_command().state(), CommandState::Ready);
        assert!(blocked.as_command().entries().is_empty());
    }

    #[tokio::test]
    async fn children_added_during_execute_are_picked_up() {
        let root = RootCommand::new("run");
        let spawning = ClosureCommand::new(|cmd| async move {
            cmd.add("late", logging_node("late child ran"));
        });
        root.as_command().add("spawning", spawning.clone());

        let (tx, mut rx) = monitor_channel();
        let runner = Runner::new(root.clone(), 2);
        assert!(runner.run(Some(tx)).await);

        let late = &spawning.as_command().children()[0];
        assert_eq!(late.as_command().state(), CommandState::Completed);

        // the monitor saw the late child get announced
        let mut announced = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            if let MonitorEvent::ChildAdded { caption, .. } = evt {
                announced.push(caption);
            }
        }
        assert!(announced.iter().any(|c| c == "late"));
    }

    #[tokio::test]
    async fn panics_are_recorded_not_fatal() {
        let root = RootCommand::new("run");
        let panicking = ClosureCommand::new(|_| async {
            panic!("exploded on purpose");
        });
        root.as_command().add("panicking", panicking.clone());
        let ok = root.as_command().add("ok", logging_node("survived"));

        let runner = Runner::new(root.clone(), 2);
        assert!(!runner.run(None).await);
        assert!(panicking.as_command().any_error());
        assert_eq!(panicking.as_command().state(), CommandState::Completed);
        assert_eq!(ok.as_command().state(), CommandState::Completed);
        let entries = panicking.as_command().entries();
        let fault = entries[0].fault.as_ref().expect("fault entry");
        assert!(fault.message.contains("exploded on purpose"));
    }

    #[tokio::test]
    async fn paused_nodes_count_as_settled() {
        let root = RootCommand::new("run");
        let pausing = ClosureCommand::new(|cmd| async move {
            cmd.log("parking");
            cmd.set_state(CommandState::Paused);
        });
        root.as_command().add("pausing", pausing.clone());

        let runner = Runner::new(root.clone(), 1);
        assert!(runner.run(None).await);
        assert_eq!(pausing.as_command().state(), CommandState::Paused);
    }

    #[tokio::test]
    async fn remote_nodes_are_never_scheduled() {
        let root = RootCommand::new("run");
        let mirror = crate::commands::MirrorCommand::new("mirror");
        mirror.as_command().set_state(CommandState::Completed);
        root.as_command().add("mirror", mirror.clone());

        let runner = Runner::new(root.clone(), 1);
        assert!(runner.run(None).await);
        assert!(mirror.as_command().entries().is_empty());
    }
}
