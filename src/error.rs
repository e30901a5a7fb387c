use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the writer side. Only setup operations return these; the
/// tracing hot path never fails.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("filesystem full while creating {}", .0.display())]
    FilesystemFull(PathBuf),
    #[error("resize refused while {0} other trace files are open")]
    ResizeBusy(usize),
    #[error("trace handle is closed")]
    Closed,
    #[error("a trace file for {0} is already open")]
    IdentityInUse(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TraceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TraceError::Io { path: path.into(), source }
    }
}

/// Fatal reader setup failures. Each one is scoped to a single file.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("{}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("empty file not supported: {}", .0.display())]
    Empty(PathBuf),
    #[error("{} is version {version}; only versions from {oldest} on are supported", path.display())]
    UnsupportedVersion { path: PathBuf, version: u32, oldest: u32 },
    #[error("{} has an inconsistent layout", .0.display())]
    BadLayout(PathBuf),
    #[error("{}: file changed while reading, try again", .0.display())]
    ChangedWhileReading(PathBuf),
    #[error("error writing output: {0}")]
    Output(#[from] io::Error),
    #[error("output closed")]
    OutputClosed,
    #[error("watching files: {0}")]
    Watch(#[from] nix::Error),
}

/// A message that kept failing validation past the retry threshold.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct Corruption {
    /// Set when the id at the cursor could be read.
    pub msg_id: Option<u32>,
    pub reason: String,
}

impl Corruption {
    pub fn new(msg_id: Option<u32>, reason: impl Into<String>) -> Self {
        Self { msg_id, reason: reason.into() }
    }
}

/// A dictionary entry that cannot be turned into a formatter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("unsupported format: {0}")]
    UnsupportedKey(String),
    #[error("type key {0} collides with the optional prefix")]
    ReservedKey(String),
}
