//! Reverse tunnels letting remote hooks reach the orchestrator

mod forward;
mod manager;
mod ports;

pub use forward::{ForwardHandle, ReverseForwarder, SshReverseForwarder};
pub use manager::{EnsuredTunnel, TunnelManager};
pub use ports::PortAllocator;

/// Callback URL as seen from the remote end of a tunnel
pub fn tunnel_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}
