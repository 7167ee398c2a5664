/// Errors from the hypervisor driver.
#[derive(Debug, thiserror::Error)]
pub enum VzError {
    #[error("invalid path: {0}")]
    InvalidPath(std::path::PathBuf),

    #[error("VM config validation failed: {0}")]
    InvalidVmConfig(String),

    #[error("VM failed to start: {0}")]
    StartFailed(String),

    #[error("VM failed to stop: {0}")]
    StopFailed(String),

    #[error("VM failed to pause: {0}")]
    PauseFailed(String),

    #[error("VM failed to resume: {0}")]
    ResumeFailed(String),

    #[error("request stop rejected: {0}")]
    RequestStopFailed(String),

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VzError>;
