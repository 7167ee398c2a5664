/// Supervisor-level errors. Every task in the scope resolves to one of
/// these; the first one to surface cancels the whole graph.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] podvm_core::Error),

    #[error(transparent)]
    Net(#[from] podvm_net::NetError),

    #[cfg(target_os = "macos")]
    #[error(transparent)]
    Vz(#[from] podvm_vz::VzError),

    #[error("signal caught, received {0} signal")]
    Signal(&'static str),

    #[error("bind pid {0} is not alive")]
    BindPidDead(i32),

    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("VM is stopped")]
    VmStopped,

    #[error("{task} panicked")]
    TaskPanic { task: &'static str },

    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when shutdown was operator-initiated rather than a fault.
    pub fn is_signal(&self) -> bool {
        matches!(self, Error::Signal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
