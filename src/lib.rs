pub mod encode;
pub mod error;
pub mod frame;
pub mod options;
pub mod pipe;
pub mod process;
pub mod reader;
pub mod writer;

mod sys;

pub use error::{Error, Result};
pub use options::SpawnOptions;
pub use process::{Process, KILLED_BY_SIGNAL};
pub use reader::timeout_from_millis;

/// Spawns `program` with `args` and returns the live handle.
///
/// Shorthand for [`Process::spawn`].
pub fn spawn<S: AsRef<str>>(program: &str, args: &[S], options: &SpawnOptions) -> Result<Process> {
    Process::spawn(program, args, options)
}
