use std::path::PathBuf;

use thiserror::Error;

/// Classifies a network failure independently of the backend that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Connect,
    Auth,
    Timeout,
    Send,
    Receive,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkErrorKind::Connect => "connect",
            NetworkErrorKind::Auth => "authorization",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Send => "send",
            NetworkErrorKind::Receive => "receive",
        };
        f.write_str(s)
    }
}

/// The primary error type for all operations in the `barque` crate.
///
/// Recoverable failures travel through this type; invariant violations
/// that indicate a programmer bug use `debug_assert!` instead and are
/// unreachable in release builds.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error, with the path where it happened (empty when no
    /// single path is involved).
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("network {kind} error: {detail}")]
    Network { kind: NetworkErrorKind, detail: String },

    #[error("FTP authorization failed")]
    FtpAuth,

    #[error("host '{0}' not found")]
    HostNotFound(String),

    #[error("operation is not supported by this storage type")]
    NotSupported,

    #[error("corrupt archive at offset {offset}")]
    CorruptArchive { offset: u64 },

    #[error("unsupported cipher id {0}")]
    UnsupportedCipher(u16),

    #[error("unsupported compression id {0}")]
    UnsupportedCompression(u16),

    #[error("file '{}' already exists", .0.display())]
    FileExists(PathBuf),

    #[error("file '{}' not found", .0.display())]
    FileNotFound(PathBuf),

    #[error("'{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("insufficient memory")]
    InsufficientMemory,

    #[error("aborted")]
    Aborted,

    #[error("loading volume failed")]
    LoadVolumeFail,

    #[error("verify of '{}' failed at offset {offset}", path.display())]
    VerifyFailed { path: PathBuf, offset: u64 },

    #[error("optical drive not found")]
    OpticalDriveNotFound,

    #[error("creating ISO9660 image failed: {0}")]
    CreateIso(String),

    #[error("opening optical medium failed")]
    OpenOptical,

    #[error("writing optical medium failed: {0}")]
    WriteOptical(String),

    #[error("too many concurrent connections")]
    TooManyConnections,

    #[error("no archive file name given")]
    NoArchiveFileName,

    #[error("no password given for encrypted archive")]
    NoCryptPassword,

    #[error("invalid storage URI for scheme '{scheme}'")]
    InvalidUri { scheme: String },
}

impl Error {
    /// Attach a path to a bare `std::io::Error`.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Error::Io { source, path: path.into() }
    }

    pub fn network(kind: NetworkErrorKind, detail: impl Into<String>) -> Self {
        Error::Network { kind, detail: detail.into() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io { source: err, path: PathBuf::new() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
