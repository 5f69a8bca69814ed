use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Program name, argument or environment entry cannot be passed to the OS.
    #[error("invalid {0}")]
    Encoding(String),

    #[error("failed to create pipe: {0}")]
    PipeCreation(#[source] io::Error),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        /// Native error code reported by the OS, when there is one.
        code: Option<i32>,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid spawn options: {0}")]
    Config(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn spawn(program: &str, source: io::Error) -> Self {
        Error::Spawn {
            program: program.to_owned(),
            code: source.raw_os_error(),
            source,
        }
    }

    /// Native OS error code carried by this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Spawn { code, .. } => *code,
            Error::PipeCreation(e) | Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spawn_error_keeps_os_code() {
        let err = Error::spawn("missing", io::Error::from_raw_os_error(2));
        assert_eq!(Some(2), err.os_code());
        let msg = err.to_string();
        assert!(msg.contains("missing"), "{}", msg);
    }

    #[test]
    fn encoding_error_has_no_code() {
        let err = Error::Encoding("argument: contains NUL".into());
        assert_eq!(None, err.os_code());
        assert_eq!("invalid argument: contains NUL", err.to_string());
    }

    #[test]
    fn config_error_from_json() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }
}
