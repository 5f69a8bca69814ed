use std::{io, thread};

use crate::{options::WRITE_BACKOFF, pipe::WriteEndpoint};

/// Writes all of `data` to `endpoint`, retrying partial writes.
///
/// Interrupted calls are retried at once and would-block outcomes after a
/// short pause. A zero-length write (reader gone) or a hard error stops the
/// loop; the count written so far is returned either way.
pub fn write_all<E: WriteEndpoint>(endpoint: &mut E, data: &[u8]) -> usize {
    let mut written = 0;
    while written < data.len() {
        match endpoint.write(&data[written..]) {
            Ok(0) => {
                log::debug!("Pipe reader closed after {} of {} bytes", written, data.len());
                break;
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(WRITE_BACKOFF),
            Err(e) => {
                log::warn!("Write failed after {} of {} bytes: {}", written, data.len(), e);
                break;
            }
        }
    }
    written
}
