/// Errors produced while preparing or supervising an instance.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("need {0} in versions")]
    MissingVersion(&'static str),

    #[error("{0} is not a regular file")]
    NotRegularFile(std::path::PathBuf),

    #[error("create pid file failed: {0}")]
    PidFileCreate(std::io::Error),

    #[error("lock pid file failed: {0}")]
    PidFileLock(nix::errno::Errno),

    #[error("write pid file failed: {0}")]
    PidFileWrite(std::io::Error),

    #[error("no usable port in {start}..{end}")]
    NoUsablePort { start: u16, end: u16 },

    #[error("ssh-keygen not found: {0}")]
    KeygenMissing(which::Error),

    #[error("failed to generate keys: {0}")]
    KeygenFailed(String),

    #[error("get executable path error: {0}")]
    ExecutablePath(std::io::Error),

    #[error("create sparse file failed: {0}")]
    SparseFile(std::io::Error),

    #[error("task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_missing_version() {
        let err = Error::MissingVersion("kernel");
        assert_eq!(err.to_string(), "need kernel in versions");
    }

    #[test]
    fn error_display_invalid_config() {
        let err = Error::InvalidConfig("memory is required".to_string());
        assert_eq!(err.to_string(), "invalid configuration: memory is required");
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }
}
