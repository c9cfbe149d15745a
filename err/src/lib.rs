//! Error taxonomy shared by every `fatrs` crate.
//!
//! Kept as its own crate so that `fatrs_ds` (device I/O) and `fatrs_fat`
//! (the filesystem engine) can both produce and consume the same variants
//! without a dependency cycle.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not implemented")]
    Unimplemented,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Fs(#[from] FatError),
}

/// The core's error taxonomy.
///
/// `Corrupt` covers every on-disk invariant violation; the string payload
/// carries the specific reason so callers don't have to guess from the
/// variant name alone.
#[derive(thiserror::Error, Debug)]
pub enum FatError {
    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("read-only")]
    ReadOnly,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADir(String),

    #[error("is a directory: {0}")]
    IsADir(String),

    #[error("expected a file: {0}")]
    FileExpected(String),

    #[error("expected a directory: {0}")]
    DirectoryExpected(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("encoded long name exceeds 255 UTF-16 code units")]
    NameTooLong,

    #[error("no space left on device")]
    NoSpace,

    #[error("file would exceed the 4 GiB FAT size limit")]
    TooBig,

    #[error("LFN checksum mismatch")]
    BrokenLfn,

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("cannot remove the root directory")]
    RemoveRoot,

    #[error("cluster chain passes through a BAD cluster")]
    BadCluster,

    #[error("cluster chain points to a FREE cluster")]
    CorruptChain,

    #[error("invalid FAT entry value {0:#X}")]
    InvalidFatEntry(u32),

    #[error("invalid seek argument")]
    InvalidArg,

    #[error("directory entry has no attached long name")]
    NoLongName,

    #[error("directory entry already has a parent")]
    AlreadyParented,

    #[error("invalid date or time value")]
    InvalidDateTime,
}

pub type Result<T> = core::result::Result<T, Error>;
