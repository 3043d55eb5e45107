use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::DynValue;
use crate::command::{CommandId, CommandState, LogEntry};

/// One step in the evolution of a command tree. The stream is totally ordered
/// per producer; nothing is guaranteed across disjoint producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    ChildAdded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<CommandId>,
        id: CommandId,
        caption: String,
    },
    StateChange {
        id: CommandId,
        state: CommandState,
    },
    Log {
        id: CommandId,
        entry: LogEntry,
    },
    Result {
        id: CommandId,
        value: DynValue,
    },
    Panic {
        message: String,
    },
}

pub type MonitorSender = mpsc::UnboundedSender<MonitorEvent>;
pub type MonitorReceiver = mpsc::UnboundedReceiver<MonitorEvent>;

/// Event emission happens under the command lock and must never block, and
/// dropping events would corrupt remote mirrors, so the channel is unbounded.
pub fn monitor_channel() -> (MonitorSender, MonitorReceiver) {
    mpsc::unbounded_channel()
}
