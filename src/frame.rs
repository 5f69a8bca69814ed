//! Length-prefixed frames: a 4-byte little-endian length, one `\n`, then
//! exactly that many payload bytes.

use std::{
    io,
    time::{Duration, Instant},
};

use crate::{
    pipe::ReadEndpoint,
    reader::{deadline_after, StreamReader},
    Error, Result,
};

const HEADER_LEN: usize = 5;
const SEPARATOR: u8 = b'\n';

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.push(SEPARATOR);
    frame.extend_from_slice(payload);
    frame
}

/// Something frames can be pulled from with exact-length reads.
pub trait FrameSource {
    fn read_exact(&mut self, len: usize, timeout: Option<Duration>) -> Result<Vec<u8>>;
    fn at_eof(&self) -> bool;
}

impl<E: ReadEndpoint> FrameSource for StreamReader<E> {
    fn read_exact(&mut self, len: usize, timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.read(Some(len), timeout)
    }

    fn at_eof(&self) -> bool {
        self.is_eof()
    }
}

/// Reassembles frames, holding on to a partial one across timeouts.
#[derive(Debug, Default)]
pub struct FrameReader {
    pending: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of an incomplete frame received so far.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns the next complete payload.
    ///
    /// `Ok(None)` means the timeout ran out (any partial frame is kept for
    /// the next call) or the stream ended cleanly between frames. A stream
    /// ending inside a frame, or a bad separator, is an error.
    pub fn read_frame<S: FrameSource>(
        &mut self,
        source: &mut S,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>> {
        let deadline = deadline_after(timeout);
        loop {
            let missing = self.missing()?;
            if missing == 0 {
                let frame = self.pending.split_off(HEADER_LEN);
                self.pending.clear();
                return Ok(Some(frame));
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let chunk = source.read_exact(missing, remaining)?;
            let short = chunk.len() < missing;
            self.pending.extend_from_slice(&chunk);
            if short {
                if source.at_eof() && !self.pending.is_empty() {
                    let pending = self.pending.len();
                    self.pending.clear();
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("stream ended inside a frame after {} bytes", pending),
                    )));
                }
                return Ok(None);
            }
        }
    }

    fn missing(&self) -> Result<usize> {
        if self.pending.len() < HEADER_LEN {
            return Ok(HEADER_LEN - self.pending.len());
        }
        if self.pending[HEADER_LEN - 1] != SEPARATOR {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame header is not followed by a newline",
            )));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.pending[..4]);
        Ok(HEADER_LEN + u32::from_le_bytes(len) as usize - self.pending.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out scripted bytes. Each stall entry cuts one read short once
    /// that many more bytes have gone out, the way a timeout would.
    struct Scripted {
        data: VecDeque<u8>,
        stalls: VecDeque<usize>,
        eof_when_empty: bool,
        eof: bool,
    }

    impl Scripted {
        fn new(data: &[u8], stalls: Vec<usize>, eof_when_empty: bool) -> Self {
            Scripted {
                data: data.iter().copied().collect(),
                stalls: stalls.into(),
                eof_when_empty,
                eof: false,
            }
        }
    }

    impl FrameSource for Scripted {
        fn read_exact(&mut self, len: usize, _timeout: Option<Duration>) -> Result<Vec<u8>> {
            let mut n = len.min(self.data.len());
            if let Some(stall) = self.stalls.front_mut() {
                if *stall < n {
                    n = *stall;
                    self.stalls.pop_front();
                } else {
                    *stall -= n;
                }
            }
            let out: Vec<u8> = self.data.drain(..n).collect();
            if out.len() < len && self.data.is_empty() && self.eof_when_empty {
                self.eof = true;
            }
            Ok(out)
        }

        fn at_eof(&self) -> bool {
            self.eof
        }
    }

    fn two_frames() -> Vec<u8> {
        let mut bytes = encode_frame(b"Hello");
        bytes.extend(encode_frame(b"World!"));
        bytes
    }

    #[test]
    fn encodes_header() {
        assert_eq!(b"\x05\x00\x00\x00\nHello".to_vec(), encode_frame(b"Hello"));
        assert_eq!(b"\x00\x00\x00\x00\n".to_vec(), encode_frame(b""));
    }

    #[test]
    fn reads_consecutive_frames_then_clean_eof() {
        let mut source = Scripted::new(&two_frames(), vec![], true);
        let mut frames = FrameReader::new();
        assert_eq!(Some(b"Hello".to_vec()), frames.read_frame(&mut source, None).unwrap());
        assert_eq!(Some(b"World!".to_vec()), frames.read_frame(&mut source, None).unwrap());
        assert_eq!(None, frames.read_frame(&mut source, None).unwrap());
        assert!(source.at_eof());
    }

    #[test]
    fn unbounded_timeout_reads_frame() {
        let mut source = Scripted::new(&two_frames(), vec![], true);
        let mut frames = FrameReader::new();
        let forever = Some(Duration::MAX);
        assert_eq!(Some(b"Hello".to_vec()), frames.read_frame(&mut source, forever).unwrap());
    }

    #[test]
    fn empty_payload() {
        let mut source = Scripted::new(&encode_frame(b""), vec![], true);
        let mut frames = FrameReader::new();
        assert_eq!(Some(Vec::new()), frames.read_frame(&mut source, None).unwrap());
    }

    #[test]
    fn timeout_keeps_partial_frame() {
        // stall twice: inside the header, then inside the payload
        let mut source = Scripted::new(&two_frames(), vec![3, 4], true);
        let mut frames = FrameReader::new();
        let t = Some(Duration::from_millis(0));
        assert_eq!(None, frames.read_frame(&mut source, t).unwrap());
        assert_eq!(3, frames.pending());
        assert_eq!(None, frames.read_frame(&mut source, t).unwrap());
        assert_eq!(7, frames.pending());
        assert_eq!(Some(b"Hello".to_vec()), frames.read_frame(&mut source, t).unwrap());
        assert_eq!(0, frames.pending());
        assert_eq!(Some(b"World!".to_vec()), frames.read_frame(&mut source, t).unwrap());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut bytes = encode_frame(b"Hello");
        bytes.truncate(7);
        let mut source = Scripted::new(&bytes, vec![], true);
        let mut frames = FrameReader::new();
        let err = frames.read_frame(&mut source, None).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(io::ErrorKind::UnexpectedEof, e.kind()),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn bad_separator_is_an_error() {
        let mut source = Scripted::new(b"\x01\x00\x00\x00Xa", vec![], true);
        let mut frames = FrameReader::new();
        match frames.read_frame(&mut source, None) {
            Err(Error::Io(e)) => assert_eq!(io::ErrorKind::InvalidData, e.kind()),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
