#![cfg(target_os = "macos")]

mod delegate;
mod device;
mod error;
mod state;
mod vm;
mod vsock;

pub use device::{Device, VmSpec};
pub use error::{Result, VzError};
pub use state::{Capabilities, VmState};
pub use vm::VmHandle;
pub use vsock::{VsockProxies, connect_vsocks};
