use std::any::Any;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as OsCommand;

use crate::command::{Command, CommandNode};
use crate::fault::Fault;

/// Placeholder node at the top of a tree. Does no work itself.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RootCommand {
    command: Command,
}

impl RootCommand {
    pub fn new(caption: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(caption),
        })
    }
}

#[async_trait]
impl CommandNode for RootCommand {
    async fn execute(self: Arc<Self>) {}

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Local placeholder for a command executing on a peer. Never scheduled by a
/// local runner; the remote bridge mutates it from mirrored events.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MirrorCommand {
    command: Command,
}

impl MirrorCommand {
    pub fn new(caption: impl Into<String>) -> Arc<Self> {
        let node = Self {
            command: Command::new(caption),
        };
        node.command.set_remote(true);
        Arc::new(node)
    }
}

#[async_trait]
impl CommandNode for MirrorCommand {
    async fn execute(self: Arc<Self>) {}

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type ClosureFn = Box<dyn Fn(Arc<Command>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Node executing an arbitrary closure against its own header. Local only;
/// closures cannot cross the wire.
pub struct ClosureCommand {
    command: Arc<Command>,
    func: ClosureFn,
}

impl ClosureCommand {
    pub fn new<F, Fut>(func: F) -> Arc<Self>
    where
        F: Fn(Arc<Command>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            command: Arc::new(Command::new("")),
            func: Box::new(move |cmd| func(cmd).boxed()),
        })
    }
}

#[async_trait]
impl CommandNode for ClosureCommand {
    async fn execute(self: Arc<Self>) {
        (self.func)(Arc::clone(&self.command)).await;
    }

    fn as_command(&self) -> &Command {
        self.command.as_ref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Runs a sequence of shell lines, logging stdout and stderr line-wise with a
/// configurable prefix. Stops at the first failing line.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ShellCommands {
    command: Command,
    pub dir: String,
    pub log_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_message: Option<String>,
    pub commands: Vec<String>,
}

impl ShellCommands {
    pub fn new(
        dir: impl Into<String>,
        elapsed_message: Option<String>,
        log_prefix: impl Into<String>,
        commands: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            dir: dir.into(),
            log_prefix: log_prefix.into(),
            elapsed_message,
            commands,
        })
    }
}

#[async_trait]
impl CommandNode for ShellCommands {
    async fn execute(self: Arc<Self>) {
        let start = Instant::now();
        for line in &self.commands {
            let mut cmd = OsCommand::new("/bin/bash");
            cmd.arg("-c").arg(line);
            if !self.dir.is_empty() {
                cmd.current_dir(&self.dir);
            }
            if let Err(fault) = run_logged(&self.command, cmd, &self.log_prefix).await {
                self.command.err(fault);
                return;
            }
        }
        if let Some(message) = &self.elapsed_message {
            self.command
                .log(format!("{} ({:.1?})", message, start.elapsed()));
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Runs a single program with arguments, logging output line-wise.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExecCommand {
    command: Command,
    pub dir: String,
    pub program: String,
    pub args: Vec<String>,
    pub log_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_message: Option<String>,
}

impl ExecCommand {
    pub fn new(
        dir: impl Into<String>,
        elapsed_message: Option<String>,
        log_prefix: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            command: Command::new(""),
            dir: dir.into(),
            program: program.into(),
            args,
            log_prefix: log_prefix.into(),
            elapsed_message,
        })
    }
}

#[async_trait]
impl CommandNode for ExecCommand {
    async fn execute(self: Arc<Self>) {
        let start = Instant::now();
        if let Err(fault) = os_exec(
            &self.command,
            &self.dir,
            &self.log_prefix,
            &self.program,
            &self.args,
        )
        .await
        {
            self.command.err(fault);
        }
        if let Some(message) = &self.elapsed_message {
            self.command
                .log(format!("{} ({:.1?})", message, start.elapsed()));
        }
    }

    fn as_command(&self) -> &Command {
        &self.command
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Spawns `program` and streams its output into `owner`'s log, stdout as
/// messages and stderr as faults, one entry per line.
pub async fn os_exec(
    owner: &Command,
    dir: &str,
    log_prefix: &str,
    program: &str,
    args: &[String],
) -> Result<(), Fault> {
    let mut cmd = OsCommand::new(program);
    cmd.args(args);
    if !dir.is_empty() {
        cmd.current_dir(dir);
    }
    run_logged(owner, cmd, log_prefix).await
}

async fn run_logged(owner: &Command, mut cmd: OsCommand, prefix: &str) -> Result<(), Fault> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|err| Fault::new(format!("could not spawn process: {err}")))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let pump_out = pump_lines(stdout, |line| owner.log(format!("{prefix}{line}")));
    let pump_err = pump_lines(stderr, |line| owner.err(Fault::new(format!("{prefix}{line}"))));
    let (_, _, status) = tokio::join!(pump_out, pump_err, child.wait());
    let status = status.map_err(Fault::from)?;
    if !status.success() {
        return Err(Fault::new(format!("process exited with {status}")));
    }
    Ok(())
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: Option<R>, mut emit: impl FnMut(&str)) {
    let Some(mut reader) = reader else { return };
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => splitter.push(&buf[..n], &mut emit),
        }
    }
    splitter.finish(&mut emit);
}

/// Accumulates byte chunks and emits one string per newline-terminated run.
/// Consecutive `\r`/`\n` bytes are treated as a single terminator.
#[derive(Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8], emit: &mut impl FnMut(&str)) {
        self.buf.extend_from_slice(bytes);
        loop {
            let Some(end) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                return;
            };
            let mut next = end;
            while next < self.buf.len() && (self.buf[next] == b'\n' || self.buf[next] == b'\r') {
                next += 1;
            }
            let line = String::from_utf8_lossy(&self.buf[..end]).into_owned();
            self.buf.drain(..next);
            emit(&line);
        }
    }

    pub fn finish(&mut self, emit: &mut impl FnMut(&str)) {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            emit(&line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut splitter = LineSplitter::default();
        let mut lines = Vec::new();
        let mut emit = |line: &str| lines.push(line.to_string());
        for chunk in chunks {
            splitter.push(chunk, &mut emit);
        }
        splitter.finish(&mut emit);
        lines
    }

    #[test]
    fn splits_lines_across_chunks() {
        let lines = split_all(&[b"hel", b"lo\nwor", b"ld\n"]);
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn crlf_counts_as_one_terminator() {
        let lines = split_all(&[b"one\r\ntwo\r\n"]);
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn trailing_partial_line_is_flushed() {
        let lines = split_all(&[b"no newline"]);
        assert_eq!(lines, vec!["no newline"]);
    }

    #[tokio::test]
    async fn shell_commands_log_stdout_lines() {
        let node = ShellCommands::new("", None, "> ", vec!["echo first; echo second".to_string()]);
        node.clone().execute().await;
        let entries = node.as_command().entries();
        let messages: Vec<String> = entries.iter().filter_map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["> first", "> second"]);
        assert!(!node.as_command().any_error());
    }

    #[tokio::test]
    async fn failing_shell_line_records_fault_and_stops() {
        let node = ShellCommands::new(
            "",
            None,
            "",
            vec!["false".to_string(), "echo never".to_string()],
        );
        node.clone().execute().await;
        assert!(node.as_command().any_error());
        let entries = node.as_command().entries();
        assert!(entries.iter().all(|e| e.message.as_deref() != Some("never")));
    }

    #[tokio::test]
    async fn exec_command_runs_program() {
        let node = ExecCommand::new("", None, "", "echo", vec!["hi there".to_string()]);
        node.clone().execute().await;
        let entries = node.as_command().entries();
        assert_eq!(entries[0].message.as_deref(), Some("hi there"));
    }
}
