//! fork/exec backend over file descriptors.

use std::{
    ffi::CString,
    fs::{self, File},
    io::{self, Read, Write},
    iter,
    mem::MaybeUninit,
    os::{
        raw::{c_char, c_int, c_void},
        unix::{
            ffi::OsStrExt,
            io::{AsFd, AsRawFd, OwnedFd, RawFd},
        },
    },
    ptr,
    time::Duration,
};

use nix::{
    errno::Errno,
    libc,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::{
        signal::{self, pthread_sigmask, SigSet, SigmaskHow, Signal},
        wait::{self, WaitPidFlag, WaitStatus},
    },
    unistd::{self, ForkResult, Pid},
};

use super::ChildStdio;
use crate::{
    encode,
    pipe::{ReadEndpoint, Readiness, WriteEndpoint},
    process::KILLED_BY_SIGNAL,
    Error, Result, SpawnOptions,
};

/// Exit status of a child whose exec step failed.
const EXEC_FAILED: c_int = 127;

/// One end of an anonymous pipe. Closed on drop.
pub struct PipeEnd {
    file: File,
}

impl PipeEnd {
    fn new(fd: OwnedFd) -> Self {
        PipeEnd { file: File::from(fd) }
    }
}

impl ReadEndpoint for PipeEnd {
    fn poll_readable(&mut self, wait: Duration) -> io::Result<Readiness> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        // round up so a sub-millisecond wait does not turn into a spin;
        // longer waits are sliced by the callers anyway
        let ms = ((wait.as_nanos() + 999_999) / 1_000_000).min(u128::from(u16::MAX)) as u16;
        if poll(&mut fds, PollTimeout::from(ms))? == 0 {
            return Ok(Readiness::Pending);
        }
        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        if revents.contains(PollFlags::POLLIN) {
            Ok(Readiness::Ready)
        } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            Ok(Readiness::Hangup)
        } else if revents.contains(PollFlags::POLLNVAL) {
            Err(Errno::EBADF.into())
        } else {
            Ok(Readiness::Pending)
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl WriteEndpoint for PipeEnd {
    /// Writes without raising SIGPIPE: a reader that went away shows up as
    /// an `EPIPE` error whatever the host's SIGPIPE disposition is.
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let _blocked = SigpipeBlock::new()?;
        self.file.write(data)
    }
}

fn sigpipe_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGPIPE);
    set
}

fn sigpipe_pending() -> bool {
    let mut pending = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(pending.as_mut_ptr());
        libc::sigpending(pending.as_mut_ptr()) == 0
            && libc::sigismember(pending.as_ptr(), libc::SIGPIPE) == 1
    }
}

/// Keeps SIGPIPE blocked on the current thread while alive. A SIGPIPE the
/// guarded write raised is consumed before the old mask comes back.
struct SigpipeBlock {
    previous: SigSet,
    was_pending: bool,
}

impl SigpipeBlock {
    fn new() -> io::Result<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigpipe_set()), Some(&mut previous))?;
        Ok(SigpipeBlock {
            previous,
            was_pending: sigpipe_pending(),
        })
    }
}

impl Drop for SigpipeBlock {
    fn drop(&mut self) {
        if !self.was_pending && sigpipe_pending() {
            if let Err(e) = sigpipe_set().wait() {
                log::debug!("Could not consume SIGPIPE: {}", e);
            }
        }
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            log::warn!("Could not restore signal mask: {}", e);
        }
    }
}

/// Creates a pipe with close-on-exec set on both ends.
///
/// The child end survives exec only through `dup2` onto 0, 1 or 2, which
/// does not carry the flag over.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read, write) = unistd::pipe()?;
    for fd in &[&read, &write] {
        let flags = FdFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD)?);
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// Every pipe a spawn asked for. Child ends are closed when this is dropped,
/// on success and on every error path alike.
struct StdioPipes {
    parent: ChildStdio,
    child_stdin: Option<OwnedFd>,
    child_stdout: Option<OwnedFd>,
    child_stderr: Option<OwnedFd>,
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
            let (read, write) = pipe().map_err(Error::PipeCreation)?;
            pipes.parent.stdin = Some(PipeEnd::new(write));
            pipes.child_stdin = Some(read);
        }
        if options.use_stdout {
            let (read, write) = pipe().map_err(Error::PipeCreation)?;
            pipes.parent.stdout = Some(PipeEnd::new(read));
            pipes.child_stdout = Some(write);
        }
        if options.stderr_pipe_requested() {
            let (read, write) = pipe().map_err(Error::PipeCreation)?;
            pipes.parent.stderr = Some(PipeEnd::new(read));
            pipes.child_stderr = Some(write);
        }
        Ok(pipes)
    }
}

/// Everything the forked child touches, prepared before the fork so the
/// child never allocates.
struct ExecPlan {
    path: CString,
    argv: Vec<CString>,
    envp: Option<Vec<CString>>,
    cwd: Option<CString>,
    diagnostic: Vec<u8>,
}

impl ExecPlan {
    fn new<S: AsRef<str>>(program: &str, args: &[S], options: &SpawnOptions) -> Result<Self> {
        let argv = encode::argv(program, args)?;

        let (path, envp) = if options.has_custom_env() {
            // execve does not search PATH, so resolve against ours now
            let resolved = encode::resolve_program(program)
                .ok_or_else(|| Error::spawn(program, Errno::ENOENT.into()))?;
            let path = CString::new(resolved.as_os_str().as_bytes())
                .map_err(|_| Error::Encoding("program path: contains NUL byte".into()))?;
            (path, Some(encode::envp(&options.env)?))
        } else {
            (argv[0].clone(), None)
        };

        let cwd = match options.cwd {
            Some(ref dir) => {
                let meta = fs::metadata(dir).map_err(|e| Error::spawn(program, e))?;
                if !meta.is_dir() {
                    return Err(Error::spawn(program, Errno::ENOTDIR.into()));
                }
                Some(
                    CString::new(dir.as_os_str().as_bytes())
                        .map_err(|_| Error::Encoding("working directory: contains NUL byte".into()))?,
                )
            }
            None => None,
        };

        Ok(ExecPlan {
            path,
            argv,
            envp,
            cwd,
            diagnostic: format!("procpipe: failed to execute '{}'\n", program).into_bytes(),
        })
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(iter::once(ptr::null()))
        .collect()
}

pub fn spawn<S: AsRef<str>>(
    program: &str,
    args: &[S],
    options: &SpawnOptions,
) -> Result<(Child, ChildStdio)> {
    let plan = ExecPlan::new(program, args, options)?;
    let argv = null_terminated(&plan.argv);
    let envp = plan.envp.as_ref().map(|env| null_terminated(env));
    let pipes = StdioPipes::create(options)?;

    let stdin = pipes.child_stdin.as_ref().map(AsRawFd::as_raw_fd);
    let stdout = pipes.child_stdout.as_ref().map(AsRawFd::as_raw_fd);
    let stderr = pipes.child_stderr.as_ref().map(AsRawFd::as_raw_fd);

    let pid = match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => unsafe {
            exec_child(
                &plan,
                &argv,
                envp.as_deref(),
                [stdin, stdout, stderr],
                options.combine_stdout_stderr,
            )
        },
        Err(e) => return Err(Error::spawn(program, e.into())),
    };

    // the parent keeps only its own ends
    let StdioPipes {
        parent,
        child_stdin,
        child_stdout,
        child_stderr,
    } = pipes;
    drop((child_stdin, child_stdout, child_stderr));
    log::debug!("Spawned '{}' with pid {}", program, pid);
    Ok((Child { pid }, parent))
}

/// Runs in the forked child: wire stdio, change directory, exec.
///
/// Only async-signal-safe calls are made here. Nothing returns to the
/// caller; any failure ends the child with status 127.
unsafe fn exec_child(
    plan: &ExecPlan,
    argv: &[*const c_char],
    envp: Option<&[*const c_char]>,
    stdio: [Option<RawFd>; 3],
    merge_stderr: bool,
) -> ! {
    let targets = [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO];
    for (fd, target) in stdio.iter().zip(targets.iter()) {
        if let Some(fd) = *fd {
            if !redirect(fd, *target) {
                exec_failed(plan);
            }
        }
    }
    if merge_stderr && libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) == -1 {
        exec_failed(plan);
    }
    if let Some(ref dir) = plan.cwd {
        if libc::chdir(dir.as_ptr()) == -1 {
            exec_failed(plan);
        }
    }
    // Rust runtimes ignore SIGPIPE and that disposition would survive exec
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    match envp {
        Some(envp) => {
            libc::execve(plan.path.as_ptr(), argv.as_ptr(), envp.as_ptr());
        }
        None => {
            libc::execvp(plan.path.as_ptr(), argv.as_ptr());
        }
    }
    exec_failed(plan)
}

unsafe fn redirect(fd: RawFd, target: RawFd) -> bool {
    if fd == target {
        // dup2 onto itself would leave close-on-exec set
        libc::fcntl(fd, libc::F_SETFD, 0) != -1
    } else {
        libc::dup2(fd, target) != -1
    }
}

unsafe fn exec_failed(plan: &ExecPlan) -> ! {
    libc::write(
        libc::STDERR_FILENO,
        plan.diagnostic.as_ptr() as *const c_void,
        plan.diagnostic.len(),
    );
    libc::_exit(EXEC_FAILED)
}

/// Exit code for a final status, `None` while the child is still around.
fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(..) => Some(KILLED_BY_SIGNAL),
        _ => None,
    }
}

/// A forked child that has not been reaped yet.
pub struct Child {
    pid: Pid,
}

impl Child {
    pub fn id(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        self.waitpid(Some(WaitPidFlag::WNOHANG))
    }

    pub fn wait(&mut self) -> io::Result<i32> {
        loop {
            if let Some(code) = self.waitpid(None)? {
                return Ok(code);
            }
        }
    }

    fn waitpid(&mut self, flags: Option<WaitPidFlag>) -> io::Result<Option<i32>> {
        loop {
            match wait::waitpid(self.pid, flags) {
                Ok(status) => return Ok(exit_code(status)),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sends SIGTERM. Returns whether a cooperative request exists here.
    pub fn request_exit(&mut self) -> io::Result<bool> {
        signal::kill(self.pid, Signal::SIGTERM)?;
        Ok(true)
    }

    pub fn kill(&mut self) -> io::Result<()> {
        signal::kill(self.pid, Signal::SIGKILL)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::{
        fcntl::{fcntl, FcntlArg, FdFlag},
        sys::signal::SigHandler,
    };

    #[test]
    fn pipe_ends_are_cloexec() {
        let (read, write) = pipe().unwrap();
        for fd in &[read.as_raw_fd(), write.as_raw_fd()] {
            let flags = FdFlag::from_bits_truncate(fcntl(*fd, FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn pipe_end_round_trip() {
        let (read, write) = pipe().unwrap();
        let (mut read, mut write) = (PipeEnd::new(read), PipeEnd::new(write));
        assert_eq!(
            Readiness::Pending,
            read.poll_readable(Duration::from_millis(0)).unwrap()
        );
        assert_eq!(3, write.write(b"abc").unwrap());
        assert_eq!(
            Readiness::Ready,
            read.poll_readable(Duration::from_millis(10)).unwrap()
        );
        let mut buf = [0u8; 8];
        assert_eq!(3, ReadEndpoint::read(&mut read, &mut buf).unwrap());
        assert_eq!(b"abc", &buf[..3]);

        drop(write);
        assert_eq!(
            Readiness::Hangup,
            read.poll_readable(Duration::from_millis(10)).unwrap()
        );
        assert_eq!(0, ReadEndpoint::read(&mut read, &mut buf).unwrap());
    }

    #[test]
    fn long_poll_wait_is_accepted() {
        let (read, write) = pipe().unwrap();
        let mut read = PipeEnd::new(read);
        drop(write);
        assert_eq!(
            Readiness::Hangup,
            read.poll_readable(Duration::from_secs(3600)).unwrap()
        );
    }

    #[test]
    fn closed_reader_is_epipe_not_a_signal() {
        let (read, write) = pipe().unwrap();
        drop(read);
        let mut write = PipeEnd::new(write);

        let previous = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) }.unwrap();
        let result = WriteEndpoint::write(&mut write, b"lost");
        unsafe { signal::signal(Signal::SIGPIPE, previous) }.unwrap();

        assert_eq!(Some(libc::EPIPE), result.unwrap_err().raw_os_error());
        assert!(!sigpipe_pending());
    }

    #[test]
    fn only_requested_pipes_are_created() {
        let options = SpawnOptions::new().stdout(true).stderr(true).combine_output(true);
        let pipes = StdioPipes::create(&options).unwrap();
        assert!(pipes.parent.stdin.is_none());
        assert!(pipes.parent.stdout.is_some());
        assert!(pipes.parent.stderr.is_none());
        assert!(pipes.child_stdout.is_some());
        assert!(pipes.child_stderr.is_none());
    }

    #[test]
    fn exit_code_from_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(Some(42), exit_code(WaitStatus::Exited(pid, 42)));
        assert_eq!(Some(0), exit_code(WaitStatus::Exited(pid, 0)));
        assert_eq!(
            Some(KILLED_BY_SIGNAL),
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false))
        );
        assert_eq!(None, exit_code(WaitStatus::StillAlive));
        assert_eq!(None, exit_code(WaitStatus::Stopped(pid, Signal::SIGSTOP)));
    }

    #[test]
    fn missing_cwd_fails_before_fork() {
        let options = SpawnOptions::new().cwd("/definitely/not/here");
        match spawn("true", &[] as &[&str], &options) {
            Err(Error::Spawn { code, .. }) => assert_eq!(Some(libc::ENOENT), code),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unresolvable_program_with_env_fails_before_fork() {
        let options = SpawnOptions::new().env("FOO", "bar");
        match spawn("no-such-program-procpipe", &[] as &[&str], &options) {
            Err(Error::Spawn { code, .. }) => assert_eq!(Some(libc::ENOENT), code),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
