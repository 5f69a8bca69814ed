use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Largest chunk a default-length read hands back.
pub const READ_CHUNK: usize = 4096;
/// Upper bound on a single readiness wait inside read loops.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Pause before retrying a write that would block.
pub const WRITE_BACKOFF: Duration = Duration::from_millis(1);
/// How long a graceful termination waits before force-killing.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);
/// Liveness polling step used while waiting with a deadline.
pub const LIVENESS_INTERVAL: Duration = Duration::from_millis(50);

/// Which standard streams to capture and how to set up the child.
///
/// An empty `env` means the child inherits the parent environment as is.
/// With `combine_stdout_stderr` set, no separate stderr pipe is created and
/// the child's stderr shares the stdout stream.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnOptions {
    pub use_stdin: bool,
    pub use_stdout: bool,
    pub use_stderr: bool,
    pub combine_stdout_stderr: bool,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from their JSON form, e.g. `{"useStdout": true}`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn stdin(mut self, enabled: bool) -> Self {
        self.use_stdin = enabled;
        self
    }

    pub fn stdout(mut self, enabled: bool) -> Self {
        self.use_stdout = enabled;
        self
    }

    pub fn stderr(mut self, enabled: bool) -> Self {
        self.use_stderr = enabled;
        self
    }

    pub fn combine_output(mut self, enabled: bool) -> Self {
        self.combine_stdout_stderr = enabled;
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// True when stderr gets a pipe of its own.
    pub fn stderr_pipe_requested(&self) -> bool {
        self.use_stderr && !self.combine_stdout_stderr
    }

    pub fn has_custom_env(&self) -> bool {
        !self.env.is_empty()
    }
}
