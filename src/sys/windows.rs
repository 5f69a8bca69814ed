//! CreateProcessW backend over anonymous pipe handles.
//!
//! Anonymous pipes cannot be waited on for readability, so readiness is
//! found by peeking at a bounded interval.

use std::{
    ffi::c_void,
    fs, io, iter, mem,
    os::windows::{
        ffi::OsStrExt,
        io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle},
    },
    ptr, thread,
    time::{Duration, Instant},
};

use windows_sys::Win32::{
    Foundation::{
        DuplicateHandle, SetHandleInformation, DUPLICATE_SAME_ACCESS, ERROR_BROKEN_PIPE,
        ERROR_DIRECTORY, HANDLE, HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
        WAIT_TIMEOUT,
    },
    Security::SECURITY_ATTRIBUTES,
    Storage::FileSystem::{ReadFile, WriteFile},
    System::{
        Console::{GetStdHandle, STD_ERROR_HANDLE, STD_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE},
        Pipes::{CreatePipe, PeekNamedPipe},
        Threading::{
            CreateProcessW, GetCurrentProcess, GetExitCodeProcess, TerminateProcess,
            WaitForSingleObject,
            CREATE_UNICODE_ENVIRONMENT, INFINITE, PROCESS_INFORMATION, STARTF_USESTDHANDLES,
            STARTUPINFOW,
        },
    },
};

use super::ChildStdio;
use crate::{
    encode,
    pipe::{ReadEndpoint, Readiness, WriteEndpoint},
    process::KILLED_BY_SIGNAL,
    Error, Result, SpawnOptions,
};

/// Longest sleep between two peeks.
const PEEK_INTERVAL: Duration = Duration::from_millis(10);

fn cvt(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn is_broken_pipe(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32)
}

/// One end of an anonymous pipe. Closed on drop.
pub struct PipeEnd {
    handle: OwnedHandle,
}

impl PipeEnd {
    fn new(handle: OwnedHandle) -> Self {
        PipeEnd { handle }
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle() as HANDLE
    }

    fn available(&self) -> io::Result<u32> {
        let mut avail: u32 = 0;
        cvt(unsafe {
            PeekNamedPipe(
                self.raw(),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut avail,
                ptr::null_mut(),
            )
        })?;
        Ok(avail)
    }
}

impl ReadEndpoint for PipeEnd {
    fn poll_readable(&mut self, wait: Duration) -> io::Result<Readiness> {
        let deadline = Instant::now().checked_add(wait);
        loop {
            match self.available() {
                Ok(0) => {}
                Ok(_) => return Ok(Readiness::Ready),
                Err(ref e) if is_broken_pipe(e) => return Ok(Readiness::Hangup),
                Err(e) => return Err(e),
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Readiness::Pending);
                    }
                    (deadline - now).min(PEEK_INTERVAL)
                }
                None => PEEK_INTERVAL,
            };
            thread::sleep(pause);
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(u32::MAX as usize) as u32;
        let mut read: u32 = 0;
        let ret = unsafe { ReadFile(self.raw(), buf.as_mut_ptr(), len, &mut read, ptr::null_mut()) };
        match cvt(ret) {
            Ok(()) => Ok(read as usize),
            // the writer closing its end is how EOF shows up on a pipe
            Err(ref e) if is_broken_pipe(e) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl WriteEndpoint for PipeEnd {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let len = data.len().min(u32::MAX as usize) as u32;
        let mut written: u32 = 0;
        cvt(unsafe { WriteFile(self.raw(), data.as_ptr(), len, &mut written, ptr::null_mut()) })?;
        Ok(written as usize)
    }
}

/// Creates an inheritable pipe, then strips inheritance from the end the
/// parent keeps.
fn pipe(parent_reads: bool) -> io::Result<(OwnedHandle, OwnedHandle)> {
    let attrs = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: 1,
    };
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    cvt(unsafe { CreatePipe(&mut read, &mut write, &attrs, 0) })?;
    let (read, write) = unsafe {
        (
            OwnedHandle::from_raw_handle(read as RawHandle),
            OwnedHandle::from_raw_handle(write as RawHandle),
        )
    };
    let parent_end = if parent_reads { &read } else { &write };
    cvt(unsafe { SetHandleInformation(parent_end.as_raw_handle() as HANDLE, HANDLE_FLAG_INHERIT, 0) })?;
    Ok((read, write))
}

/// Inheritable copy of `handle`, valid in any child created with handle
/// inheritance on.
fn inheritable_duplicate(handle: HANDLE) -> io::Result<OwnedHandle> {
    let mut dup: HANDLE = ptr::null_mut();
    cvt(unsafe {
        DuplicateHandle(
            GetCurrentProcess(),
            handle,
            GetCurrentProcess(),
            &mut dup,
            0,
            1,
            DUPLICATE_SAME_ACCESS,
        )
    })?;
    Ok(unsafe { OwnedHandle::from_raw_handle(dup as RawHandle) })
}

/// Our own standard handle `std`, made inheritable for a stream the child
/// shares with us. `None` when we have no such handle.
fn inherit_std(std: STD_HANDLE) -> io::Result<Option<OwnedHandle>> {
    let handle = unsafe { GetStdHandle(std) };
    if handle.is_null() || handle == INVALID_HANDLE_VALUE {
        return Ok(None);
    }
    inheritable_duplicate(handle).map(Some)
}

/// Every handle a spawn hands to the child: requested pipe ends plus
/// inheritable copies of our standard handles for the streams it shares.
/// Child-side handles are closed when this is dropped, on success and on
/// every error path alike.
struct StdioPipes {
    parent: ChildStdio,
    child_stdin: Option<OwnedHandle>,
    child_stdout: Option<OwnedHandle>,
    child_stderr: Option<OwnedHandle>,
}

impl StdioPipes {
    fn create(options: &SpawnOptions) -> Result<Self> {
        let mut pipes = StdioPipes {
            parent: ChildStdio {
                stdin: None,
                stdout: None,
                stderr: None,
            },
            child_stdin: None,
            child_stdout: None,
            child_stderr: None,
        };
        if options.use_stdin {
            let (read, write) = pipe(false).map_err(Error::PipeCreation)?;
            pipes.parent.stdin = Some(PipeEnd::new(write));
            pipes.child_stdin = Some(read);
        } else {
            pipes.child_stdin = inherit_std(STD_INPUT_HANDLE)?;
        }
        if options.use_stdout {
            let (read, write) = pipe(true).map_err(Error::PipeCreation)?;
            pipes.parent.stdout = Some(PipeEnd::new(read));
            pipes.child_stdout = Some(write);
        } else {
            pipes.child_stdout = inherit_std(STD_OUTPUT_HANDLE)?;
        }
        if options.stderr_pipe_requested() {
            let (read, write) = pipe(true).map_err(Error::PipeCreation)?;
            pipes.parent.stderr = Some(PipeEnd::new(read));
            pipes.child_stderr = Some(write);
        } else if !options.combine_stdout_stderr {
            pipes.child_stderr = inherit_std(STD_ERROR_HANDLE)?;
        }
        Ok(pipes)
    }
}

fn raw(end: &Option<OwnedHandle>) -> HANDLE {
    end.as_ref()
        .map_or(ptr::null_mut(), |handle| handle.as_raw_handle() as HANDLE)
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(iter::once(0)).collect()
}

pub fn spawn<S: AsRef<str>>(
    program: &str,
    args: &[S],
    options: &SpawnOptions,
) -> Result<(Child, ChildStdio)> {
    let mut command_line = wide(&encode::command_line(program, args)?);
    let env_block: Option<Vec<u16>> = if options.has_custom_env() {
        Some(encode::env_block(&options.env)?.encode_utf16().collect())
    } else {
        None
    };
    let cwd: Option<Vec<u16>> = match options.cwd {
        Some(ref dir) => {
            let meta = fs::metadata(dir).map_err(|e| Error::spawn(program, e))?;
            if !meta.is_dir() {
                return Err(Error::spawn(
                    program,
                    io::Error::from_raw_os_error(ERROR_DIRECTORY as i32),
                ));
            }
            Some(dir.as_os_str().encode_wide().chain(iter::once(0)).collect())
        }
        None => None,
    };

    let pipes = StdioPipes::create(options)?;

    let mut startup: STARTUPINFOW = unsafe { mem::zeroed() };
    startup.cb = mem::size_of::<STARTUPINFOW>() as u32;
    startup.dwFlags = STARTF_USESTDHANDLES;
    startup.hStdInput = raw(&pipes.child_stdin);
    startup.hStdOutput = raw(&pipes.child_stdout);
    startup.hStdError = if options.combine_stdout_stderr {
        startup.hStdOutput
    } else {
        raw(&pipes.child_stderr)
    };

    let flags = if env_block.is_some() {
        CREATE_UNICODE_ENVIRONMENT
    } else {
        0
    };
    let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
    let ret = unsafe {
        CreateProcessW(
            ptr::null(),
            command_line.as_mut_ptr(),
            ptr::null(),
            ptr::null(),
            1,
            flags,
            env_block
                .as_ref()
                .map_or(ptr::null(), |block| block.as_ptr() as *const c_void),
            cwd.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
            &startup,
            &mut info,
        )
    };
    if ret == 0 {
        return Err(Error::spawn(program, io::Error::last_os_error()));
    }

    let (process, _thread) = unsafe {
        (
            OwnedHandle::from_raw_handle(info.hProcess as RawHandle),
            OwnedHandle::from_raw_handle(info.hThread as RawHandle),
        )
    };
    // the parent keeps only its own ends
    let StdioPipes {
        parent,
        child_stdin,
        child_stdout,
        child_stderr,
    } = pipes;
    drop((child_stdin, child_stdout, child_stderr));
    log::debug!("Spawned '{}' with pid {}", program, info.dwProcessId);
    Ok((
        Child {
            handle: process,
            pid: info.dwProcessId,
        },
        parent,
    ))
}

/// Exit code used for forced termination; reads back as the signal sentinel.
const FORCED_EXIT_CODE: u32 = KILLED_BY_SIGNAL as u32;

pub struct Child {
    handle: OwnedHandle,
    pid: u32,
}

impl Child {
    pub fn id(&self) -> u32 {
        self.pid
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle() as HANDLE
    }

    fn exit_code(&self) -> io::Result<i32> {
        let mut code: u32 = 0;
        cvt(unsafe { GetExitCodeProcess(self.raw(), &mut code) })?;
        Ok(code as i32)
    }

    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        match unsafe { WaitForSingleObject(self.raw(), 0) } {
            WAIT_OBJECT_0 => self.exit_code().map(Some),
            WAIT_TIMEOUT => Ok(None),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn wait(&mut self) -> io::Result<i32> {
        match unsafe { WaitForSingleObject(self.raw(), INFINITE) } {
            WAIT_OBJECT_0 => self.exit_code(),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Windows has no cooperative termination request for arbitrary
    /// processes.
    pub fn request_exit(&mut self) -> io::Result<bool> {
        Ok(false)
    }

    pub fn kill(&mut self) -> io::Result<()> {
        cvt(unsafe { TerminateProcess(self.raw(), FORCED_EXIT_CODE) })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use windows_sys::Win32::Foundation::GetHandleInformation;

    #[test]
    fn forced_exit_code_reads_back_as_sentinel() {
        assert_eq!(KILLED_BY_SIGNAL, FORCED_EXIT_CODE as i32);
    }

    fn is_inheritable(handle: &OwnedHandle) -> bool {
        let mut flags: u32 = 0;
        cvt(unsafe { GetHandleInformation(handle.as_raw_handle() as HANDLE, &mut flags) }).unwrap();
        flags & HANDLE_FLAG_INHERIT != 0
    }

    #[test]
    fn shared_handles_are_duplicated_inheritable() {
        // the parent's end of a pipe is deliberately not inheritable
        let (read, _write) = pipe(true).unwrap();
        assert!(!is_inheritable(&read));
        let dup = inheritable_duplicate(read.as_raw_handle() as HANDLE).unwrap();
        assert!(is_inheritable(&dup));

        for std in &[STD_INPUT_HANDLE, STD_OUTPUT_HANDLE, STD_ERROR_HANDLE] {
            if let Some(handle) = inherit_std(*std).unwrap() {
                assert!(is_inheritable(&handle));
            }
        }
    }

    #[test]
    fn merged_stderr_gets_no_handle_of_its_own() {
        let options = SpawnOptions::new().stdout(true).combine_output(true);
        let pipes = StdioPipes::create(&options).unwrap();
        assert!(pipes.parent.stdout.is_some());
        assert!(pipes.parent.stderr.is_none());
        assert!(pipes.child_stderr.is_none());
    }

    #[test]
    fn pipe_end_round_trip() {
        let (read, write) = pipe(true).unwrap();
        let (mut read, mut write) = (PipeEnd::new(read), PipeEnd::new(write));
        assert_eq!(
            Readiness::Pending,
            read.poll_readable(Duration::from_millis(0)).unwrap()
        );
        assert_eq!(3, write.write(b"abc").unwrap());
        assert_eq!(
            Readiness::Ready,
            read.poll_readable(Duration::from_millis(50)).unwrap()
        );
        let mut buf = [0u8; 8];
        assert_eq!(3, read.read(&mut buf).unwrap());
        drop(write);
        assert_eq!(
            Readiness::Hangup,
            read.poll_readable(Duration::from_millis(50)).unwrap()
        );
        assert_eq!(0, read.read(&mut buf).unwrap());
    }
}
