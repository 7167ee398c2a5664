//! Host TCP port reservation for the SSH forward.

use crate::error::{Error, Result};
use std::net::{Ipv4Addr, TcpListener};

const SCAN_RANGE: u16 = 100;

/// Returns the first port in `[start, start + 100)` that can be bound on
/// loopback.
pub fn find_usable_port(start: u16) -> Result<u16> {
    for port in start..start.saturating_add(SCAN_RANGE) {
        if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
            return Ok(port);
        }
    }

    Err(Error::NoUsablePort {
        start,
        end: start.saturating_add(SCAN_RANGE),
    })
}
