/// Errors from the virtual network.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("network stack is gone")]
    StackGone,

    #[error("guest connection refused on port {0}")]
    ConnectRefused(u16),

    #[error("invalid forward spec: {0}")]
    InvalidForward(String),

    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    #[error("ssh key: {0}")]
    SshKey(#[from] russh::keys::Error),

    #[error("ssh authentication as {0} rejected")]
    SshAuth(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
