use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::{Error as _, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{self, DynValue};
use crate::fault::Fault;
use crate::monitor::{MonitorEvent, MonitorSender};

pub type CommandId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> CommandId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    #[default]
    Ready,
    Running,
    Paused,
    Completed,
}

/// One timestamped line in a command's execution log. Either a plain message
/// or a fault; faults latch the owning command's `any_error` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    pub time: DateTime<Utc>,
}

impl LogEntry {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            fault: None,
            time: Utc::now(),
        }
    }

    pub fn error(fault: Fault) -> Self {
        Self {
            message: None,
            fault: Some(fault),
            time: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.fault.is_some()
    }
}

/// A unit of work in a command tree.
///
/// Implementors embed a [`Command`] header and return it from `as_command`;
/// everything the runner, the monitor and the wire codec need lives there.
/// `execute` runs the node's side effects and reports through the header.
#[async_trait]
pub trait CommandNode: Send + Sync + 'static {
    async fn execute(self: Arc<Self>);
    fn as_command(&self) -> &Command;
    fn as_any(&self) -> &dyn Any;
}

struct Body {
    caption: String,
    state: CommandState,
    log: Vec<LogEntry>,
    any_error: bool,
    children: Vec<Arc<dyn CommandNode>>,
    remote: bool,
    result: Option<DynValue>,
    progress: f64,
    monitor: Option<MonitorSender>,
}

/// Shared header of every command node: identity, caption, execution state,
/// children, log, result and progress. All mutation goes through one lock,
/// which is never held across `execute`.
pub struct Command {
    id: CommandId,
    body: Mutex<Body>,
}

impl Command {
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            id: next_id(),
            body: Mutex::new(Body {
                caption: caption.into(),
                state: CommandState::Ready,
                log: Vec::new(),
                any_error: false,
                children: Vec::new(),
                remote: false,
                result: None,
                progress: 0.0,
                monitor: None,
            }),
        }
    }

    fn body(&self) -> MutexGuard<'_, Body> {
        self.body.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn caption(&self) -> String {
        self.body().caption.clone()
    }

    pub(crate) fn set_caption(&self, caption: impl Into<String>) {
        self.body().caption = caption.into();
    }

    pub fn state(&self) -> CommandState {
        self.body().state
    }

    /// Sets the state without emitting an event. Used by the orchestrator to
    /// flip `Paused` back to `Ready` between phases and by the remote bridge
    /// to apply mirrored state changes.
    pub fn set_state(&self, state: CommandState) {
        self.body().state = state;
    }

    pub fn remote(&self) -> bool {
        self.body().remote
    }

    pub fn set_remote(&self, remote: bool) {
        self.body().remote = remote;
    }

    pub fn any_error(&self) -> bool {
        self.body().any_error
    }

    pub fn progress(&self) -> f64 {
        self.body().progress
    }

    pub fn set_progress(&self, progress: f64) {
        self.body().progress = progress;
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.body().log.clone()
    }

    pub fn children(&self) -> Vec<Arc<dyn CommandNode>> {
        self.body().children.clone()
    }

    pub fn retain_children(&self, f: impl FnMut(&Arc<dyn CommandNode>) -> bool) {
        self.body().children.retain(f);
    }

    /// Appends `child` under this node, assigning it the given caption, and
    /// returns it. Children may be appended at any time, including while this
    /// node is executing; the runner picks them up on its next pass.
    pub fn add(&self, caption: impl Into<String>, child: Arc<dyn CommandNode>) -> Arc<dyn CommandNode> {
        child.as_command().set_caption(caption);
        self.body().children.push(child.clone());
        child
    }

    pub fn log(&self, message: impl Into<String>) {
        self.append_entry(LogEntry::message(message));
    }

    pub fn err(&self, fault: impl Into<Fault>) {
        self.append_entry(LogEntry::error(fault.into()));
    }

    /// Appends a prepared entry, latching `any_error` for faults. The entry is
    /// emitted to the monitor before the node lock is released, so per-node
    /// event order matches log order.
    pub fn append_entry(&self, entry: LogEntry) {
        let mut body = self.body();
        if entry.is_error() {
            body.any_error = true;
        }
        body.log.push(entry.clone());
        if let Some(monitor) = &body.monitor {
            let _ = monitor.send(MonitorEvent::Log { id: self.id, entry });
        }
    }

    pub fn result(&self) -> Option<DynValue> {
        self.body().result.clone()
    }

    /// Stores the node's result. A result is immutable once set; later calls
    /// keep the first value.
    pub fn set_result(&self, value: DynValue) {
        let mut body = self.body();
        if body.result.is_some() {
            tracing::debug!(id = self.id, "ignoring second result on command");
            return;
        }
        body.result = Some(value.clone());
        if let Some(monitor) = &body.monitor {
            let _ = monitor.send(MonitorEvent::Result { id: self.id, value });
        }
    }

    /// Ready → Running transition done by a runner worker. Attaches the
    /// monitor sink and announces the transition. Returns false when the node
    /// was not in `Ready` (another worker got there first, or the node was
    /// parked), in which case nothing changes.
    pub(crate) fn begin_run(&self, monitor: Option<MonitorSender>) -> bool {
        let mut body = self.body();
        if body.state != CommandState::Ready {
            return false;
        }
        body.state = CommandState::Running;
        body.monitor = monitor;
        if let Some(monitor) = &body.monitor {
            let _ = monitor.send(MonitorEvent::StateChange {
                id: self.id,
                state: CommandState::Running,
            });
        }
        true
    }

    /// Latches `Completed` after `execute` returns, unless the node parked
    /// itself in `Paused`. Emits the resulting state either way, then drops
    /// the monitor so the run's event channel can close.
    pub(crate) fn finish_run(&self) {
        let mut body = self.body();
        if body.state == CommandState::Running {
            body.state = CommandState::Completed;
        }
        let state = body.state;
        if let Some(monitor) = &body.monitor {
            let _ = monitor.send(MonitorEvent::StateChange { id: self.id, state });
        }
        body.monitor = None;
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::new("")
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body();
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("caption", &body.caption)
            .field("state", &body.state)
            .field("any_error", &body.any_error)
            .field("children", &body.children.len())
            .finish()
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = self.body();
        let children = body
            .children
            .iter()
            .map(|child| codec::encode_node(child.as_ref()).map_err(S::Error::custom))
            .collect::<Result<Vec<_>, _>>()?;
        let mut s = serializer.serialize_struct("Command", 4)?;
        s.serialize_field("caption", &body.caption)?;
        s.serialize_field("state", &body.state)?;
        s.serialize_field("remote", &body.remote)?;
        s.serialize_field("children", &children)?;
        s.end()
    }
}

#[derive(Deserialize)]
struct CommandWire {
    #[serde(default)]
    caption: String,
    #[serde(default)]
    state: CommandState,
    #[serde(default)]
    remote: bool,
    #[serde(default)]
    children: Vec<serde_json::Value>,
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = CommandWire::deserialize(deserializer)?;
        let children = wire
            .children
            .into_iter()
            .map(|value| codec::decode_node(value).map_err(D::Error::custom))
            .collect::<Result<Vec<_>, _>>()?;
        // the receiving process assigns fresh ids; the caller only ever learns
        // ids from the announcements in the event stream
        let command = Command::new(wire.caption);
        {
            let mut body = command.body();
            body.state = wire.state;
            body.remote = wire.remote;
            body.children = children;
        }
        Ok(command)
    }
}

/// Collects every node reachable from `root`, depth first.
pub fn collect_nodes(root: &Arc<dyn CommandNode>) -> Vec<Arc<dyn CommandNode>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(node) = stack.pop() {
        if !seen.insert(node.as_command().id()) {
            continue;
        }
        stack.extend(node.as_command().children());
        out.push(node);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::RootCommand;
    use crate::monitor::monitor_channel;

    #[test]
    fn error_entries_latch_any_error() {
        let cmd = Command::new("unit");
        cmd.log("fine");
        assert!(!cmd.any_error());
        cmd.err("broken");
        assert!(cmd.any_error());
        cmd.log("still fine");
        assert!(cmd.any_error(), "any_error is never cleared");
        assert_eq!(cmd.entries().len(), 3);
    }

    #[test]
    fn result_is_immutable_once_set() {
        let cmd = Command::new("unit");
        cmd.set_result(DynValue::new(1u32));
        cmd.set_result(DynValue::new(2u32));
        let result = cmd.result().expect("result set");
        assert_eq!(result.downcast_ref::<u32>(), Some(&1));
    }

    #[test]
    fn add_assigns_caption_and_appends() {
        let parent = Command::new("parent");
        let child = RootCommand::new("ignored");
        parent.add("renamed", child.clone());
        assert_eq!(child.as_command().caption(), "renamed");
        assert_eq!(parent.children().len(), 1);
    }

    #[test]
    fn events_follow_mutation_order() {
        let cmd = Command::new("unit");
        let (tx, mut rx) = monitor_channel();
        assert!(cmd.begin_run(Some(tx)));
        cmd.log("one");
        cmd.err("two");
        cmd.finish_run();

        let mut kinds = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            kinds.push(match evt {
                MonitorEvent::StateChange { state, .. } => format!("state:{state:?}"),
                MonitorEvent::Log { entry, .. } => {
                    format!("log:{}", entry.is_error())
                }
                other => format!("{other:?}"),
            });
        }
        assert_eq!(
            kinds,
            vec!["state:Running", "log:false", "log:true", "state:Completed"]
        );
    }
}
