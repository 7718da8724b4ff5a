use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::dirent::EntryKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type for phone sessions, transfers and certificate handling.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: EntryKind,
        found: EntryKind,
    },

    #[error("certificate format error: {0}")]
    CertificateFormat(String),

    #[error("local I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A handle close that failed while unwinding from `primary`.
    #[error("{primary} (closing the handle also failed: {close})")]
    CloseFailed {
        #[source]
        primary: Box<Error>,
        close: Box<Error>,
    },

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Error::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    pub(crate) fn closed(context: impl Into<String>) -> Self {
        Error::Transport {
            context: context.into(),
            source: None,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Combine the outcome of a transfer body with the outcome of closing its handle.
    pub(crate) fn with_close<T>(body: Result<T>, close: Result<()>) -> Result<T> {
        match (body, close) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(close)) => Err(close),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(close)) => Err(Error::CloseFailed {
                primary: Box::new(primary),
                close: Box::new(close),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = Error::protocol("unexpected init response");
        assert_eq!(err.to_string(), "protocol error: unexpected init response");

        let err = Error::TypeMismatch {
            path: "/c/Pictures".to_string(),
            expected: EntryKind::File,
            found: EntryKind::Directory,
        };
        assert_eq!(
            err.to_string(),
            "/c/Pictures: expected file, found directory"
        );

        let err = Error::closed("stream closed");
        assert_eq!(err.to_string(), "transport error: stream closed");
    }

    #[test]
    fn test_with_close_keeps_primary_error() {
        let body: Result<()> = Err(Error::protocol("short block"));
        let close = Err(Error::closed("write failed"));
        let err = Error::with_close(body, close).unwrap_err();
        match &err {
            Error::CloseFailed { primary, close } => {
                assert!(matches!(**primary, Error::Protocol(_)));
                assert!(matches!(**close, Error::Transport { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.source().map(|s| s.to_string()),
            Some("protocol error: short block".to_string())
        );
    }

    #[test]
    fn test_with_close_reports_close_after_success() {
        let err = Error::with_close(Ok(7u32), Err(Error::closed("gone"))).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(Error::with_close(Ok(7u32), Ok(())).unwrap(), 7);
    }
}
