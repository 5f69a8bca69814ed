//! Blocking, non-blocking, timed and exact-length reads over one stream.

use std::{
    io,
    time::{Duration, Instant},
};

use crate::{
    options::{POLL_INTERVAL, READ_CHUNK},
    pipe::{ReadEndpoint, Readiness},
    Result,
};

/// Converts the integer timeout convention: negative waits forever,
/// zero returns immediately, anything else is a deadline in milliseconds.
pub fn timeout_from_millis(ms: i64) -> Option<Duration> {
    if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

/// Deadline `timeout` from now. A timeout too large to represent has no
/// deadline, same as `None`.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Read side of one captured stream plus its latched EOF flag.
pub struct StreamReader<E> {
    endpoint: E,
    eof: bool,
}

impl<E: ReadEndpoint> StreamReader<E> {
    pub fn new(endpoint: E) -> Self {
        StreamReader {
            endpoint,
            eof: false,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Reads from the stream.
    ///
    /// With `len == None`, returns whatever one read yields once data is
    /// available, at most [`READ_CHUNK`] bytes. With `Some(n)`, keeps reading
    /// until `n` bytes are assembled; a shorter result means EOF or the
    /// deadline was hit. The timeout covers the whole call.
    pub fn read(&mut self, len: Option<usize>, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let want = len.unwrap_or(READ_CHUNK);
        if self.eof || want == 0 {
            return Ok(Vec::new());
        }
        let deadline = deadline_after(timeout);
        let mut out = Vec::with_capacity(want.min(READ_CHUNK));
        let mut chunk = vec![0u8; want.min(READ_CHUNK)];

        loop {
            let wait = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };
            match self.poll(wait) {
                Ok(Readiness::Pending) => {}
                Ok(_) => {
                    let room = (want - out.len()).min(chunk.len());
                    match self.read_once(&mut chunk[..room]) {
                        Ok(0) => {
                            self.eof = true;
                            break;
                        }
                        Ok(n) => {
                            out.extend_from_slice(&chunk[..n]);
                            if len.is_none() || out.len() == want {
                                break;
                            }
                        }
                        Err(e) => return Self::fail(out, e),
                    }
                }
                Err(e) => return Self::fail(out, e),
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Drains the stream until a read comes back empty, sharing one
    /// timeout budget across every chunk.
    pub fn read_all(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = deadline_after(timeout);
        let mut out = Vec::new();
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let chunk = self.read(None, remaining)?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Non-consuming probe: true if a read right now would return data.
    pub fn has_data(&mut self) -> bool {
        if self.eof {
            return false;
        }
        match self.poll(Duration::from_millis(0)) {
            Ok(readiness) => readiness == Readiness::Ready,
            Err(e) => {
                log::debug!("Readiness probe failed: {}", e);
                false
            }
        }
    }

    fn poll(&mut self, wait: Duration) -> io::Result<Readiness> {
        loop {
            match self.endpoint.poll_readable(wait) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn read_once(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.endpoint.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    // Bytes already taken off the pipe are handed back rather than dropped.
    fn fail(out: Vec<u8>, e: io::Error) -> Result<Vec<u8>> {
        if out.is_empty() {
            Err(e.into())
        } else {
            log::warn!("Read failed after {} bytes: {}", out.len(), e);
            Ok(out)
        }
    }
}
