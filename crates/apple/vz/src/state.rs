//! VM state as the hypervisor reports it.

use objc2_virtualization::VZVirtualMachineState;
use serde::Serialize;
use std::fmt;

/// Mirror of `VZVirtualMachineState`.
///
/// `Stopped` doubles as the not-yet-started state, which is how the
/// framework itself reports a freshly created VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Running,
    Paused,
    Error,
    Starting,
    Pausing,
    Resuming,
    Stopping,
    Saving,
    Restoring,
}

impl From<VZVirtualMachineState> for VmState {
    fn from(state: VZVirtualMachineState) -> Self {
        match state {
            VZVirtualMachineState::Running => Self::Running,
            VZVirtualMachineState::Paused => Self::Paused,
            VZVirtualMachineState::Error => Self::Error,
            VZVirtualMachineState::Starting => Self::Starting,
            VZVirtualMachineState::Pausing => Self::Pausing,
            VZVirtualMachineState::Resuming => Self::Resuming,
            VZVirtualMachineState::Stopping => Self::Stopping,
            VZVirtualMachineState::Saving => Self::Saving,
            VZVirtualMachineState::Restoring => Self::Restoring,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "Stopped",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Error => "Error",
            Self::Starting => "Starting",
            Self::Pausing => "Pausing",
            Self::Resuming => "Resuming",
            Self::Stopping => "Stopping",
            Self::Saving => "Saving",
            Self::Restoring => "Restoring",
        };
        write!(f, "{name}")
    }
}

impl Serialize for VmState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Snapshot of what the hypervisor will currently allow.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Capabilities {
    #[serde(rename = "canStart")]
    pub can_start: bool,
    #[serde(rename = "canRequestStop")]
    pub can_request_stop: bool,
    #[serde(rename = "canStop")]
    pub can_stop: bool,
    #[serde(rename = "canPause")]
    pub can_pause: bool,
    #[serde(rename = "canResume")]
    pub can_resume: bool,
}
