pub mod accept;
pub mod agent;
pub mod bindpid;
pub mod cmdline;
pub mod context;
pub mod error;
pub mod events;
pub mod group;
pub mod httpunix;
pub mod ignition;
pub mod instance;
pub mod mounts;
pub mod netstack;
pub mod ready;
pub mod restful;
pub mod signals;
pub mod timesync;

#[cfg(target_os = "macos")]
pub mod driver;
#[cfg(target_os = "macos")]
pub mod power;
#[cfg(target_os = "macos")]
pub mod supervisor;

pub use context::Ctx;
pub use error::{Error, Result};
pub use events::{AppEvent, Events};
pub use group::TaskGroup;
pub use signals::Signals;
