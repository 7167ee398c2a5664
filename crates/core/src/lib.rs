pub mod config;
pub mod error;
pub mod fsutil;
pub mod lock;
pub mod paths;
pub mod port;
pub mod process;
pub mod sshkey;
pub mod target;
pub mod versions;

pub use config::{InstanceConfig, Versions};
pub use error::{Error, Result};
pub use lock::PidLock;
pub use paths::DerivedPaths;
pub use sshkey::SshIdentity;
pub use versions::Manifest;
