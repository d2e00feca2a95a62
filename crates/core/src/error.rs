// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when reading session log files
#[derive(Debug, Error)]
pub enum TailError {
    #[error("Session log not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Permission denied reading file: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TailError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// Errors that can occur while enumerating the session log root
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Session log root not found: {path}")]
    RootNotFound { path: PathBuf },

    #[error("Cannot access session log root: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Home directory not found")]
    HomeDirNotFound,
}

impl DiscoveryError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::RootNotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_error_display() {
        let err = TailError::NotFound {
            path: "/path/to/session.jsonl".into(),
        };
        assert!(err.to_string().contains("/path/to/session.jsonl"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_tail_error_io_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = TailError::io("/test/path", io_err);
        assert!(matches!(err, TailError::NotFound { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = TailError::io("/test/path", io_err);
        assert!(matches!(err, TailError::PermissionDenied { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        let err = TailError::io("/test/path", io_err);
        assert!(matches!(err, TailError::Io { .. }));
    }

    #[test]
    fn test_discovery_error_io_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err = DiscoveryError::io("/test/path", io_err);
        assert!(matches!(err, DiscoveryError::RootNotFound { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = DiscoveryError::io("/test/path", io_err);
        assert!(matches!(err, DiscoveryError::PermissionDenied { .. }));
    }
}
