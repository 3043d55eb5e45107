mod local;
mod process;
mod scp;
mod ssh;

pub use local::LocalConnection;
pub use ssh::{SshConnection, SshSettings};
