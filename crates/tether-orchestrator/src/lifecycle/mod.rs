//! Instance lifecycle orchestration

mod controller;
mod locks;

pub use controller::{ControllerSettings, InstanceController};
pub use locks::{InstanceGuard, InstanceLocks};
