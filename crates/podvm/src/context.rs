//! Shared, read-only context threaded through every supervisor task.

use crate::events::Events;
use crate::signals::Signals;
use podvm_core::{DerivedPaths, InstanceConfig, SshIdentity};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone)]
pub struct Ctx {
    pub config: Arc<InstanceConfig>,
    pub paths: Arc<DerivedPaths>,
    pub identity: SshIdentity,
    pub ssh_port: u16,
    pub signals: Signals,
    pub events: Events,
    /// Runtime-mutable power-save flag; the control API writes it, the
    /// power monitor reads it on each host power event.
    pub power_save: Arc<AtomicBool>,
}

impl Ctx {
    pub fn power_save(&self) -> bool {
        self.power_save.load(Ordering::Relaxed)
    }

    pub fn set_power_save(&self, enable: bool) {
        self.power_save.store(enable, Ordering::Relaxed);
    }
}
