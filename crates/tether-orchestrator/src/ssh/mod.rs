//! SSH connection resolution and remote execution

pub mod client;
mod exec;
mod pool;
mod registry;

pub use client::{within, ClientHandler, SshHandle};
pub use exec::{
    guard_command, remote_path_expr, shell_quote, CommandOutput, ConnectionTest, ExecOptions,
    RemoteExecutor, SshExecutor,
};
pub use pool::ConnectionPool;
pub use registry::{expand_home, MachineRegistry, SshConfig};
