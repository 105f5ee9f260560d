use log::{debug, warn};

use crate::{
    error::{ProcMapError, Result},
    page_size, round_page,
    vmentry::VmEntry,
};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// VmMapSource
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The kernel interfaces a memory map is retrieved through.
///
/// Retrieval follows a size-probe-then-fill protocol: [`estimate`] reports how many bytes the
/// memory map of a process takes, and [`fill`] writes the records into a buffer of that size. The
/// map may grow in between, in which case [`fill`] fails with [`ProcMapError::BufferTooSmall`]
/// and the caller starts over.
///
/// [`estimate`]: #tymethod.estimate
/// [`fill`]: #tymethod.fill
pub trait VmMapSource {
    /// Returns the size in bytes needed to hold the memory map of `pid`; zero if it has none.
    fn estimate(&mut self, pid: u32) -> Result<usize>;

    /// Writes the memory map of `pid` into `buf`, returning the number of records written.
    ///
    /// # Errors
    ///
    /// Returns [`ProcMapError::BufferTooSmall`] if `buf` cannot hold every record.
    fn fill(&mut self, pid: u32, buf: &mut [VmEntry]) -> Result<usize>;

    /// Returns the address the stack of `pid` starts from.
    fn stack_pointer(&mut self, pid: u32) -> Result<u64>;

    /// Returns the soft stack size limit of the *calling* process.
    fn stack_limit(&mut self) -> Result<u64>;
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// ProcessSnapshot
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The memory map of a process at one point in time, along with what is needed to tell its stack
/// apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub(crate) pid: u32,
    pub(crate) entries: Vec<VmEntry>,
    pub(crate) stack_pointer: u64,
    pub(crate) stack_limit: u64,
}

impl ProcessSnapshot {
    /// Assemble a snapshot from parts that were retrieved elsewhere.
    pub fn new(pid: u32, entries: Vec<VmEntry>, stack_pointer: u64, stack_limit: u64) -> Self {
        ProcessSnapshot {
            pid,
            entries,
            stack_pointer,
            stack_limit,
        }
    }

    /// Returns the `PID` of the process that this snapshot concerns.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the records of the memory map, in the order the kernel reported them.
    pub fn entries(&self) -> &[VmEntry] {
        &self.entries
    }

    /// Returns the page-rounded stack pointer of the process.
    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    /// Returns the stack size assumed when looking for the stack region.
    pub fn stack_limit(&self) -> u64 {
        self.stack_limit
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Retriever
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
enum State {
    Probing,
    Filling { records: usize },
    Done(Vec<VmEntry>),
    Fatal(ProcMapError),
}

/// Retrieves [`ProcessSnapshot`]s from a [`VmMapSource`].
#[derive(Debug)]
pub struct Retriever<S> {
    source: S,
    page_size: u64,
    max_retries: usize,
}

impl<S: VmMapSource> Retriever<S> {
    /// The default number of times the buffer is regrown before giving up.
    pub const DEFAULT_MAX_RETRIES: usize = 64;

    /// Construct a new `Retriever` on top of the given source, using the system page size.
    pub fn new(source: S) -> Result<Self> {
        Ok(Self::with_page_size(source, page_size()?))
    }

    pub fn with_page_size(source: S, page_size: u64) -> Self {
        Retriever {
            source,
            page_size,
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    /// Set how many times the buffer may be regrown when the memory map changes under our feet.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns a reference to the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Retrieve the memory map, the stack pointer and the stack limit for `pid`.
    pub fn snapshot(&mut self, pid: u32) -> Result<ProcessSnapshot> {
        let entries = self.entries(pid)?;
        if entries.is_empty() {
            warn!("pid {}: no memory mappings reported", pid);
        }

        let stack_limit = self.source.stack_limit()?;
        let stack_pointer = round_page(self.source.stack_pointer(pid)?, self.page_size);
        debug!(
            "pid {}: {} entries, sp={:#x}, stack limit={:#x}",
            pid,
            entries.len(),
            stack_pointer,
            stack_limit
        );

        Ok(ProcessSnapshot {
            pid,
            entries,
            stack_pointer,
            stack_limit,
        })
    }

    /// Retrieve the records of the memory map for `pid`, regrowing the buffer as long as the map
    /// keeps outgrowing it.
    pub fn entries(&mut self, pid: u32) -> Result<Vec<VmEntry>> {
        let mut buf: Vec<VmEntry> = Vec::new();
        let mut retries = 0;
        let mut state = State::Probing;
        loop {
            debug!("pid {}: {:?}", pid, StateName(&state));
            state = match state {
                State::Probing => match self.source.estimate(pid) {
                    Ok(0) => State::Done(Vec::new()),
                    Ok(len) => State::Filling {
                        records: record_count(len),
                    },
                    Err(e) => State::Fatal(e),
                },
                State::Filling { records } => {
                    buf.clear();
                    buf.resize(records, VmEntry::default());
                    match self.source.fill(pid, &mut buf) {
                        Ok(n) => {
                            buf.truncate(n);
                            State::Done(std::mem::take(&mut buf))
                        }
                        Err(ProcMapError::BufferTooSmall { capacity }) => {
                            retries += 1;
                            if retries > self.max_retries {
                                State::Fatal(ProcMapError::RetryLimit {
                                    pid,
                                    attempts: retries,
                                })
                            } else {
                                warn!(
                                    "pid {}: memory map outgrew {} records, retrying",
                                    pid, capacity
                                );
                                State::Probing
                            }
                        }
                        Err(e) => State::Fatal(e),
                    }
                }
                State::Done(entries) => return Ok(entries),
                State::Fatal(e) => return Err(e),
            };
        }
    }
}

/// Only the name of a [`State`], so that logging does not dump whole buffers.
struct StateName<'a>(&'a State);

impl std::fmt::Debug for StateName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            State::Probing => write!(f, "Probing"),
            State::Filling { records } => write!(f, "Filling {{ records: {} }}", records),
            State::Done(entries) => write!(f, "Done({} entries)", entries.len()),
            State::Fatal(e) => write!(f, "Fatal({})", e),
        }
    }
}

/// Converts a size estimate to a number of records, rounding down when the estimate is not a
/// multiple of the record size.
fn record_count(len: usize) -> usize {
    let len = if len % VmEntry::RECORD_SIZE != 0 {
        ((len - 1) / VmEntry::RECORD_SIZE) * VmEntry::RECORD_SIZE
    } else {
        len
    };
    len / VmEntry::RECORD_SIZE
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
