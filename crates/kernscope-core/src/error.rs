//! Errors raised on the probe side.
//!
//! None of these ever escape a hook invocation. Handlers fold them into a
//! skip outcome and return control to the host.

use thiserror::Error;

/// A bounded read could not be satisfied.
///
/// The target range was unmapped, freed, or otherwise inaccessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("read of {len} bytes at {addr:#x} failed")]
pub struct ReadError {
    pub addr: u64,
    pub len: usize,
}

impl ReadError {
    pub fn new(addr: u64, len: usize) -> Self {
        Self { addr, len }
    }
}

/// A keyed table is at capacity and the key is not already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{table} is full ({capacity} entries)")]
pub struct TableFull {
    pub table: &'static str,
    pub capacity: usize,
}
