//! The live child process and everything it owns.

use std::{
    io, thread,
    time::{Duration, Instant},
};

use crate::{
    frame::FrameReader,
    options::{GRACE_PERIOD, LIVENESS_INTERVAL},
    reader::StreamReader,
    sys::{self, PipeEnd},
    writer, Error, Result, SpawnOptions,
};

/// Exit code reported for a child that did not exit normally, e.g. one
/// killed by a signal or force-terminated.
pub const KILLED_BY_SIGNAL: i32 = -1;

/// A spawned child process with its captured standard streams.
///
/// The handle exclusively owns the process and every pipe end; dropping it
/// behaves like [`Process::close`]. Calls are synchronous and the handle is
/// not meant to be shared between threads without external locking.
pub struct Process {
    program: String,
    child: Option<sys::Child>,
    exit_code: Option<i32>,
    stdin: Option<PipeEnd>,
    stdout: Option<StreamReader<PipeEnd>>,
    stderr: Option<StreamReader<PipeEnd>>,
}

impl Process {
    /// Starts `program` with `args`, wiring the streams `options` asks for.
    ///
    /// The child is running when this returns. On failure nothing acquired
    /// along the way is left open.
    pub fn spawn<S: AsRef<str>>(
        program: &str,
        args: &[S],
        options: &SpawnOptions,
    ) -> Result<Process> {
        let (child, stdio) = sys::spawn(program, args, options)?;
        Ok(Process {
            program: program.to_owned(),
            child: Some(child),
            exit_code: None,
            stdin: stdio.stdin,
            stdout: stdio.stdout.map(StreamReader::new),
            stderr: stdio.stderr.map(StreamReader::new),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id, or `None` once the child has been reaped.
    pub fn pid(&self) -> Option<u32> {
        match self.exit_code {
            Some(_) => None,
            None => self.child.as_ref().map(sys::Child::id),
        }
    }

    /// Cached exit code; `None` until the exit has been observed.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn record_exit(&mut self, code: i32) -> i32 {
        // the first observed status stays authoritative
        *self.exit_code.get_or_insert(code)
    }

    fn not_started() -> Error {
        Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "process is closed or was never started",
        ))
    }

    fn poll_exit(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        let child = self.child.as_mut().ok_or_else(Self::not_started)?;
        match child.try_wait()? {
            Some(code) => Ok(Some(self.record_exit(code))),
            None => Ok(None),
        }
    }

    /// Non-blocking liveness probe. Reaps and caches the exit code the first
    /// time the child is seen to have exited.
    pub fn is_running(&mut self) -> bool {
        match self.poll_exit() {
            Ok(status) => status.is_none(),
            Err(e) => {
                log::debug!("Liveness check for '{}' failed: {}", self.program, e);
                false
            }
        }
    }

    /// Blocks until the child exits and returns its exit code.
    pub fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let child = self.child.as_mut().ok_or_else(Self::not_started)?;
        let code = child.wait()?;
        Ok(self.record_exit(code))
    }

    /// Waits at most `timeout` for the child to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<i32>> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return self.wait().map(Some),
        };
        loop {
            if let Some(code) = self.poll_exit()? {
                return Ok(Some(code));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep((deadline - now).min(LIVENESS_INTERVAL));
        }
    }

    /// Writes `data` to the child's stdin and returns how much got through.
    ///
    /// Returns 0 when stdin is not captured or already closed. A child that
    /// stopped reading cuts the write short; on Unix this never raises
    /// SIGPIPE in the calling process.
    pub fn write(&mut self, data: &[u8]) -> usize {
        match self.stdin {
            Some(ref mut stdin) => writer::write_all(stdin, data),
            None => 0,
        }
    }

    /// Closes stdin so the child sees EOF. Safe to repeat.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Reads from stdout. See [`StreamReader::read`] for the meaning of
    /// `len` and `timeout`.
    pub fn read_stdout(&mut self, len: Option<usize>, timeout: Option<Duration>) -> Result<Vec<u8>> {
        Self::read_stream(&mut self.stdout, len, timeout)
    }

    pub fn read_stderr(&mut self, len: Option<usize>, timeout: Option<Duration>) -> Result<Vec<u8>> {
        Self::read_stream(&mut self.stderr, len, timeout)
    }

    pub fn read_all_stdout(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        match self.stdout {
            Some(ref mut reader) => reader.read_all(timeout),
            None => Ok(Vec::new()),
        }
    }

    pub fn read_all_stderr(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        match self.stderr {
            Some(ref mut reader) => reader.read_all(timeout),
            None => Ok(Vec::new()),
        }
    }

    fn read_stream(
        stream: &mut Option<StreamReader<PipeEnd>>,
        len: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        match stream {
            Some(reader) => reader.read(len, timeout),
            None => Ok(Vec::new()),
        }
    }

    pub fn has_data_stdout(&mut self) -> bool {
        self.stdout.as_mut().map_or(false, StreamReader::has_data)
    }

    pub fn has_data_stderr(&mut self) -> bool {
        self.stderr.as_mut().map_or(false, StreamReader::has_data)
    }

    pub fn is_stdout_eof(&self) -> bool {
        self.stdout.as_ref().map_or(false, StreamReader::is_eof)
    }

    pub fn is_stderr_eof(&self) -> bool {
        self.stderr.as_ref().map_or(false, StreamReader::is_eof)
    }

    /// Reads the next length-prefixed frame from stdout.
    ///
    /// `frames` keeps a partially received frame between calls, so a
    /// timeout never loses bytes.
    pub fn read_stdout_frame(
        &mut self,
        frames: &mut FrameReader,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>> {
        match self.stdout {
            Some(ref mut reader) => frames.read_frame(reader, timeout),
            None => Ok(None),
        }
    }

    /// Stops the child and reaps it.
    ///
    /// With `graceful`, a cooperative request (SIGTERM) goes first and the
    /// child gets [`GRACE_PERIOD`] to exit before it is killed. Platforms
    /// without such a request kill right away. Never fails; problems are
    /// logged.
    pub fn terminate(&mut self, graceful: bool) {
        if !self.is_running() {
            return;
        }
        if graceful && self.request_exit() {
            match self.wait_timeout(GRACE_PERIOD) {
                Ok(Some(_)) => return,
                Ok(None) => log::warn!(
                    "'{}' still running after {:?}, killing it",
                    self.program,
                    GRACE_PERIOD
                ),
                Err(e) => log::debug!("Waiting for '{}' failed: {}", self.program, e),
            }
        }
        if let Some(ref mut child) = self.child {
            if let Err(e) = child.kill() {
                log::debug!("Killing '{}' failed: {}", self.program, e);
            }
        }
        if let Err(e) = self.wait() {
            log::warn!("Reaping '{}' failed: {}", self.program, e);
        }
    }

    fn request_exit(&mut self) -> bool {
        let child = match self.child {
            Some(ref mut child) => child,
            None => return false,
        };
        match child.request_exit() {
            Ok(supported) => supported,
            Err(e) => {
                log::debug!("Termination request to '{}' failed: {}", self.program, e);
                false
            }
        }
    }

    /// Kills the child if it is still running, then releases every pipe end
    /// and the process handle. Safe to call more than once.
    pub fn close(&mut self) {
        if self.child.is_some() && self.is_running() {
            self.terminate(false);
        }
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        self.child = None;
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.close();
    }
}
