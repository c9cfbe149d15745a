//! Byte-addressable backing-store abstraction.
//!
//! `fatrs_fat` is generic over `DataStorage` so the same engine can mount a
//! plain file, a raw block device, or an in-memory buffer (used by tests)
//! without the core ever touching a concrete I/O type. Implementations are
//! expected to be safely callable from multiple threads via `&self`;
//! `fatrs_fat::Volume` relies on this and layers its own locking on top
//! rather than assuming each call is already serialised.

pub use fatrs_err::{Error, Result};

pub trait DataStorage: Send + Sync {
    /// Reads `buffer.len()` bytes starting at `offset`, failing if the
    /// device is shorter than `offset + buffer.len()`.
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes `buffer` starting at `offset`.
    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;

    /// Total addressable size of the backing store in bytes, when known.
    /// Used by the formatter to size a freshly created volume and by
    /// `Volume::open` to sanity-check `TotSec16`/`TotSec32` against the
    /// device. A storage backend that doesn't know its own size ahead of
    /// time (e.g. a growable sparse file) may return `None`.
    fn size(&self) -> Result<Option<u64>>;
}
