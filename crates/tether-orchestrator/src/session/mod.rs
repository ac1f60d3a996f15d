//! Terminal session management
//!
//! Sessions are backed by a local pty or an SSH shell, chosen once at spawn
//! time. Output is kept in a bounded ring and fanned out to live
//! subscribers.

mod backend;
mod buffer;
mod local;
mod manager;
mod remote;

pub use backend::{
    BackendCommand, BackendExit, BackendIo, BackendLauncher, BackendSpec, SystemLauncher,
    INSTANCE_ID_ENV,
};
pub use buffer::OutputRing;
pub use manager::{OutputSubscription, Session, SessionExit, SessionManager};
