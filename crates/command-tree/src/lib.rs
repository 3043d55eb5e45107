pub mod codec;
pub mod command;
pub mod commands;
pub mod fault;
pub mod monitor;
pub mod runner;
pub mod stream;

pub use codec::DynValue;
pub use command::{Command, CommandId, CommandNode, CommandState, LogEntry};
pub use commands::{ClosureCommand, ExecCommand, MirrorCommand, RootCommand, ShellCommands};
pub use fault::Fault;
pub use monitor::{monitor_channel, MonitorEvent, MonitorReceiver, MonitorSender};
pub use runner::Runner;
pub use stream::{stream_call, stream_receive, StreamError};
