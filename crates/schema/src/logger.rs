use command_tree::{Command, Fault};

/// Sink for progress reporting from provisioning and module code. Commands
/// are the usual implementation; anything else can stand in during tests.
pub trait Logger: Send + Sync {
    fn log(&self, message: String);
    fn err(&self, fault: Fault);
    fn set_progress(&self, progress: f64);
}

impl Logger for Command {
    fn log(&self, message: String) {
        Command::log(self, message);
    }

    fn err(&self, fault: Fault) {
        Command::err(self, fault);
    }

    fn set_progress(&self, progress: f64) {
        Command::set_progress(self, progress);
    }
}

/// Wraps another logger, prepending a fixed prefix to every line and fault.
pub struct PrefixLogger<'a> {
    pub prefix: String,
    pub inner: &'a dyn Logger,
}

impl<'a> PrefixLogger<'a> {
    pub fn new(prefix: impl Into<String>, inner: &'a dyn Logger) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl Logger for PrefixLogger<'_> {
    fn log(&self, message: String) {
        self.inner.log(format!("{}{}", self.prefix, message));
    }

    fn err(&self, fault: Fault) {
        self.inner.err(fault.prefixed(&self.prefix));
    }

    fn set_progress(&self, progress: f64) {
        self.inner.set_progress(progress);
    }
}
