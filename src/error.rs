//! Error taxonomy surfaced to the bridge.
//!
//! Recoverable errors travel back to the bridge as negative codes; a corrupt
//! volume at mount time aborts the daemon instead.

use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// Path resolution failed at some component.
    #[error("no such file or directory")]
    NoEntry,

    /// A path component traversed something that is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// rmdir on a directory that still holds non-reserved entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Write-like operation on an entry carrying the read-only attribute.
    #[error("permission denied")]
    PermissionDenied,

    /// Seek target out of range, malformed whence, or bad request shape.
    #[error("invalid argument")]
    InvalidArgument,

    /// A read or write could not establish its starting position.
    #[error("position past end of file")]
    EndOfFile,

    /// Creating or renaming onto a name that is already present.
    #[error("file exists")]
    AlreadyExists,

    /// The free-space map has no clusters left to hand out.
    #[error("no space left on volume")]
    NoSpace,

    /// Mount-time validation failed; fatal on the mount path.
    #[error("corrupt volume: {0}")]
    CorruptVolume(&'static str),

    /// The underlying positioned I/O failed.
    #[error("device i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Stable negative code delivered to the bridge, which converts it to
    /// the platform errno surface.
    pub fn code(&self) -> i32 {
        match self {
            FsError::NoEntry => -2,
            FsError::NotDirectory => -20,
            FsError::NotEmpty => -39,
            FsError::PermissionDenied => -13,
            FsError::InvalidArgument => -22,
            FsError::EndOfFile => -5,
            FsError::AlreadyExists => -17,
            FsError::NoSpace => -28,
            FsError::CorruptVolume(_) => -5,
            FsError::Io(_) => -5,
        }
    }
}
