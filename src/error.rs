use crate::data::Data;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while building, piping or running commands.
#[derive(Debug, Error)]
pub enum Error {
    /// The process exited with a nonzero return code and the effective
    /// raise-policy asked for it to be reported.
    #[error("command {argv:?} exited with return code {returncode}")]
    NonZero {
        /// Command line of the failed process.
        argv: Vec<String>,
        /// Exit code, `128 + signo` when the process was killed by a signal.
        returncode: i32,
        /// Captured standard output, `None` when it was passed through.
        stdout: Option<Data>,
        /// Captured standard error, `None` when it was passed through.
        stderr: Option<Data>,
    },

    /// A callback declared parameter names the pipe resolver does not know.
    #[error("signature error: {0}")]
    Signature(String),

    /// A bounded wait expired. The process is still running and can be
    /// waited on again.
    #[error("timed out after {timeout:?} waiting for {argv:?}")]
    Timeout {
        argv: Vec<String>,
        timeout: Duration,
    },

    /// A process control request was made while nothing was running.
    #[error("no background process is running for {argv:?}")]
    NoProcess { argv: Vec<String> },

    /// The program could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Lookup by name found nothing on the search path.
    #[error("command not found: {0}")]
    NotFound(String),

    /// The encoding label is not known to the codec table.
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),

    /// Bytes could not be decoded with the requested encoding.
    #[error("output is not valid {encoding}")]
    Decode { encoding: String },

    /// The descriptor has no program to run.
    #[error("empty command")]
    EmptyCommand,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Return code carried by a [`Error::NonZero`] error.
    pub fn returncode(&self) -> Option<i32> {
        match self {
            Error::NonZero { returncode, .. } => Some(*returncode),
            _ => None,
        }
    }

    /// Captured stdout carried by a [`Error::NonZero`] error.
    pub fn stdout(&self) -> Option<&Data> {
        match self {
            Error::NonZero { stdout, .. } => stdout.as_ref(),
            _ => None,
        }
    }

    /// Captured stderr carried by a [`Error::NonZero`] error.
    pub fn stderr(&self) -> Option<&Data> {
        match self {
            Error::NonZero { stderr, .. } => stderr.as_ref(),
            _ => None,
        }
    }

    /// True for the timeout condition of a bounded wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonzero_exposes_fields() {
        let err = Error::NonZero {
            argv: vec!["false".to_string()],
            returncode: 1,
            stdout: Some(Data::from("out")),
            stderr: None,
        };
        assert_eq!(err.returncode(), Some(1));
        assert_eq!(err.stdout(), Some(&Data::from("out")));
        assert!(err.stderr().is_none());
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("return code 1"));
    }

    #[test]
    fn test_other_errors_have_no_returncode() {
        let err = Error::Signature("bad".into());
        assert_eq!(err.returncode(), None);
        let err = Error::Timeout {
            argv: vec![],
            timeout: Duration::from_millis(5),
        };
        assert!(err.is_timeout());
    }
}
