mod config;
mod device;
mod dhcp;
mod dns;
mod error;
mod forward;
mod frames;
mod mux;
mod ssh;
mod ssh_forward;
mod stack;

pub use config::{DnsRecord, DnsZone, Forward, NetworkConfig, host_search_domains};
pub use error::{NetError, Result};
pub use forward::ForwardTable;
pub use mux::{serve_control, serve_guest_mux};
pub use ssh::{Acceptor, load_identity, session_over};
pub use ssh_forward::run_podman_forward;
pub use stack::{GuestStream, StackTask, VirtualNetwork};
