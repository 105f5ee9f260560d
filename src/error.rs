use std::io;

use thiserror::Error;

/// A custom `Result` type for this crate, combining a return value with a [`ProcMapError`]. It is
/// used all over the crate and also returned by many functions and methods of its external API.
pub type Result<T> = std::result::Result<T, ProcMapError>;

/// An error type returned by calls to the API exposed by this crate.
#[derive(Debug, Error)]
pub enum ProcMapError {
    /// The buffer handed to [`VmMapSource::fill`] cannot hold the whole memory map, most likely
    /// because the map of the target grew after it was last estimated.
    ///
    /// [`VmMapSource::fill`]: trait.VmMapSource.html#tymethod.fill
    #[error("memory map does not fit in a buffer of {capacity} records")]
    BufferTooSmall {
        /// The number of records the buffer could hold.
        capacity: usize,
    },

    /// The memory map kept growing between estimating and filling it.
    #[error("memory map of pid {pid} did not settle after {attempts} attempts")]
    RetryLimit {
        /// The process whose memory map was being retrieved.
        pid: u32,
        /// The number of estimate/fill cycles that were attempted.
        attempts: usize,
    },

    /// Error querying the stack size resource limit of the current process.
    #[error("could not get the stack resource limit: {0}")]
    ResourceLimit(#[source] io::Error),

    /// Protection bits outside of the `rwx` encoding space.
    #[error("unknown protection bits {0:#x}")]
    UnknownProtection(u32),

    /// Error opening a file.
    #[error("could not open '{path}': {source}")]
    Open {
        /// The path of the file that was attempted to be opened.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error reading from a file.
    #[error("could not read '{path}': {source}")]
    Read {
        /// The path of the file that was attempted to be read.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error parsing [`MemoryRegion`].
    ///
    /// [`MemoryRegion`]: struct.MemoryRegion.html
    #[error("could not parse MemoryRegion from the given addresses: '{0}'")]
    ParseMemoryRegion(String),

    /// Error parsing [`Protection`].
    ///
    /// [`Protection`]: struct.Protection.html
    #[error("could not parse valid permissions from '{0}'")]
    ParsePermissions(String),

    /// Error parsing [`DeviceNumbers`].
    ///
    /// [`DeviceNumbers`]: struct.DeviceNumbers.html
    #[error("could not parse valid DeviceNumbers from '{0}'")]
    ParseDeviceNumbers(String),

    /// Error parsing a line of `/proc/<PID>/maps` or `/proc/<PID>/smaps`.
    #[error("could not parse memory map entry from '{0}'")]
    ParseMapsEntry(String),

    /// Error parsing `/proc/<PID>/stat`.
    #[error("could not parse '{path}': {reason}")]
    ParseStat {
        /// The path of the file that was parsed.
        path: String,
        /// What was wrong with its contents.
        reason: &'static str,
    },

    /// Generic integer parsing error.
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}
