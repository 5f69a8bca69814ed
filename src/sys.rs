//! Platform backends. Exactly one is compiled in; both expose `PipeEnd`,
//! `Child` and `spawn` with the same shape.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;

/// Parent-side ends of the pipes requested for a child.
pub struct ChildStdio {
    pub stdin: Option<PipeEnd>,
    pub stdout: Option<PipeEnd>,
    pub stderr: Option<PipeEnd>,
}
