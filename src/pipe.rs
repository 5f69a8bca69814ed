//! Contract shared by the per-platform pipe endpoints.
//!
//! Each backend supplies one `PipeEnd` type owning a descriptor or handle;
//! dropping it closes the OS resource. Nothing outside `sys` sees the raw
//! representation.

use std::{io, time::Duration};

/// Outcome of a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one byte can be read without blocking.
    Ready,
    /// The writer is gone and nothing is buffered; the next read returns 0.
    Hangup,
    /// Nothing arrived within the wait.
    Pending,
}

pub trait ReadEndpoint {
    /// Waits at most `wait` for data without consuming any.
    fn poll_readable(&mut self, wait: Duration) -> io::Result<Readiness>;

    /// Reads into `buf`. `Ok(0)` means the writer closed its end.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

pub trait WriteEndpoint {
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
}
