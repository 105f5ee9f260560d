use std::convert::TryFrom;
use std::fmt;

use bitflags::bitflags;

use crate::error::{ProcMapError, Result};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MemoryRegion
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A region of virtual memory, defined by its first address and the address right past its end.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl MemoryRegion {
    /// Returns the first address included in the memory region.
    #[inline(always)]
    pub fn start_address(&self) -> u64 {
        self.start
    }

    /// Returns the address right past the end of the memory region.
    #[inline(always)]
    pub fn end_address(&self) -> u64 {
        self.end
    }

    /// Returns the last address included in the memory region, or its start address if the
    /// region is empty.
    #[inline(always)]
    pub fn last_address(&self) -> u64 {
        if self.is_empty() {
            self.end
        } else {
            self.end - 1
        }
    }

    /// Returns the size of the memory region, in bytes.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns the size of the memory region, in kilobytes (rounded down).
    #[inline(always)]
    pub fn size_kb(&self) -> u64 {
        self.size() / 1024
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl std::convert::From<(u64, u64)> for MemoryRegion {
    fn from(r: (u64, u64)) -> Self {
        debug_assert!(r.0 <= r.1);
        MemoryRegion {
            start: r.0,
            end: r.1,
        }
    }
}

impl std::str::FromStr for MemoryRegion {
    type Err = ProcMapError;

    fn from_str(s: &str) -> Result<Self> {
        let mut it = s.splitn(2, '-');
        let mut addr = || -> Result<u64> {
            it.next()
                .and_then(|a| u64::from_str_radix(a, 16).ok())
                .ok_or_else(|| ProcMapError::ParseMemoryRegion(s.into()))
        };
        let (start, end) = (addr()?, addr()?);
        if start > end {
            return Err(ProcMapError::ParseMemoryRegion(s.into()));
        }
        Ok((start, end).into())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Protection
//
///////////////////////////////////////////////////////////////////////////////////////////////////

bitflags! {
    /// Protection bits of a mapping, numbered like `PROT_READ`, `PROT_WRITE` and `PROT_EXEC`.
    #[derive(Default)]
    pub struct Protection: u32 {
        /// Permission to be read.
        const READ    = 1 << 0;
        /// Permission to be written.
        const WRITE   = 1 << 1;
        /// Permission to be executed.
        const EXECUTE = 1 << 2;
    }
}

impl std::str::FromStr for Protection {
    type Err = ProcMapError;

    /// Parses the `rwx` part of a permissions field, as found in `/proc/<PID>/maps`.
    fn from_str(s: &str) -> Result<Self> {
        let b = s.as_bytes();
        if b.len() != 3 {
            return Err(ProcMapError::ParsePermissions(s.into()));
        }
        let mut ret = Self::empty();
        for (&c, (expected, flag)) in b.iter().zip(&[
            (b'r', Self::READ),
            (b'w', Self::WRITE),
            (b'x', Self::EXECUTE),
        ]) {
            match c {
                b'-' => {}
                c if c == *expected => ret |= *flag,
                _ => return Err(ProcMapError::ParsePermissions(s.into())),
            }
        }
        Ok(ret)
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ret = "---".to_owned();
        if self.contains(Self::READ) {
            ret.replace_range(0..1, "r");
        }
        if self.contains(Self::WRITE) {
            ret.replace_range(1..2, "w");
        }
        if self.contains(Self::EXECUTE) {
            ret.replace_range(2..3, "x");
        }
        write!(f, "{}", ret)
    }
}

/// The five ways a protection value is displayed in the table layouts.
///
/// Raw values map to a class through `(bits + 1) / 2`, so write-only and exec-only protections
/// collapse into their neighbours; bits beyond `rwx` are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionClass {
    None,
    Read,
    ReadWrite,
    ReadExec,
    ReadWriteExec,
}

impl ProtectionClass {
    /// The 3-character form, e.g. `rw-`.
    pub fn rwx(self) -> &'static str {
        match self {
            Self::None => "---",
            Self::Read => "r--",
            Self::ReadWrite => "rw-",
            Self::ReadExec => "r-x",
            Self::ReadWriteExec => "rwx",
        }
    }

    /// The word form, e.g. `read/write`.
    pub fn words(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Read => "read",
            Self::ReadWrite => "read/write",
            Self::ReadExec => "read/exec",
            Self::ReadWriteExec => "read/write/exec",
        }
    }
}

impl TryFrom<u32> for ProtectionClass {
    type Error = ProcMapError;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            0 => Ok(Self::None),
            1 | 2 => Ok(Self::Read),
            3 | 4 => Ok(Self::ReadWrite),
            5 | 6 => Ok(Self::ReadExec),
            7 => Ok(Self::ReadWriteExec),
            _ => Err(ProcMapError::UnknownProtection(bits)),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// EntryType
//
///////////////////////////////////////////////////////////////////////////////////////////////////

bitflags! {
    /// Type flags of a memory map entry.
    #[derive(Default)]
    pub struct EntryType: u32 {
        /// Backed by an object, such as a file.
        const OBJ         = 0x01;
        /// Private mapping; writes are copied.
        const COPYONWRITE = 0x04;
        /// Copy-on-write has not happened yet for any page.
        const NEEDSCOPY   = 0x08;
        /// A gap in the address space that is not mapped.
        const HOLE        = 0x10;
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Inheritance & Advice
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// What a child process inherits from the mapping on `fork(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Inheritance {
    Share = 0,
    Copy = 1,
    None = 2,
    Zero = 3,
}

impl Default for Inheritance {
    fn default() -> Self {
        Self::Copy
    }
}

/// The `madvise(2)` hint in effect for the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Advice {
    Normal = 0,
    Random = 1,
    Sequential = 2,
}

impl Default for Advice {
    fn default() -> Self {
        Self::Normal
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// DeviceNumbers
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Major and minor numbers of a file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumbers {
    major: u32,
    minor: u32,
}

impl DeviceNumbers {
    /// Retrieve the major number.
    #[inline(always)]
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Retrieve the minor number.
    #[inline(always)]
    pub fn minor(&self) -> u32 {
        self.minor
    }
}

impl std::convert::From<(u32, u32)> for DeviceNumbers {
    fn from(p: (u32, u32)) -> Self {
        DeviceNumbers {
            major: p.0,
            minor: p.1,
        }
    }
}

impl std::str::FromStr for DeviceNumbers {
    type Err = ProcMapError;

    fn from_str(s: &str) -> Result<Self> {
        let p: Vec<_> = s
            .splitn(2, ':')
            .map(|n| {
                u32::from_str_radix(n, 16).map_err(|_| ProcMapError::ParseDeviceNumbers(s.into()))
            })
            .collect::<Result<_>>()?;
        match p[..] {
            [major, minor] => Ok((major, minor).into()),
            _ => Err(ProcMapError::ParseDeviceNumbers(s.into())),
        }
    }
}

impl fmt::Display for DeviceNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}", self.major, self.minor)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// VmEntry
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// One record of the memory map of a process, as reported by the kernel.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VmEntry {
    /// The virtual memory region that the mapping concerns.
    pub(crate) region: MemoryRegion,
    /// The offset in the object backing the mapping (if any) where the mapping begins.
    pub(crate) offset: u64,
    /// Current protection, as raw `PROT_*` bits.
    pub(crate) protection: u32,
    /// Maximum protection the mapping may ever be given, as raw `PROT_*` bits.
    pub(crate) max_protection: u32,
    pub(crate) inheritance: Inheritance,
    /// Number of pages wired (locked) in memory.
    pub(crate) wired_count: u64,
    pub(crate) advice: Advice,
    pub(crate) etype: EntryType,
    /// The major and minor numbers of the file backing the mapping, if any.
    pub(crate) dev: DeviceNumbers,
    /// The inode of the file backing the mapping, if any.
    pub(crate) inode: u64,
    /// The name of the file backing the mapping (if any), or a pseudo-path such as `[heap]`.
    pub(crate) pathname: Option<String>,
}

impl VmEntry {
    /// The size of a single record, which buffer estimates are expressed in multiples of.
    pub const RECORD_SIZE: usize = std::mem::size_of::<VmEntry>();

    /// Retrieve the virtual memory region of the mapping.
    #[inline(always)]
    pub fn memory_region(&self) -> MemoryRegion {
        self.region
    }

    /// Retrieve the offset in the object backing the mapping (if any) where the mapping begins.
    #[inline(always)]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Retrieve the raw bits of the current protection.
    #[inline(always)]
    pub fn protection(&self) -> u32 {
        self.protection
    }

    /// Retrieve the raw bits of the maximum protection.
    #[inline(always)]
    pub fn max_protection(&self) -> u32 {
        self.max_protection
    }

    /// Retrieve the current protection as flags, ignoring unknown bits.
    #[inline(always)]
    pub fn permissions(&self) -> Protection {
        Protection::from_bits_truncate(self.protection)
    }

    #[inline(always)]
    pub fn inheritance(&self) -> Inheritance {
        self.inheritance
    }

    #[inline(always)]
    pub fn wired_count(&self) -> u64 {
        self.wired_count
    }

    #[inline(always)]
    pub fn advice(&self) -> Advice {
        self.advice
    }

    #[inline(always)]
    pub fn entry_type(&self) -> EntryType {
        self.etype
    }

    /// Retrieve the major and minor numbers of the file backing the mapping, if any.
    #[inline(always)]
    pub fn device_numbers(&self) -> DeviceNumbers {
        self.dev
    }

    /// Retrieve the inode of the file backing the mapping, if any.
    #[inline(always)]
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Retrieve the name of the file backing the mapping (if any), or a pseudo-path, as described
    /// in [`procfs(5)`].
    ///
    /// [`procfs(5)`]: https://man7.org/linux/man-pages/man5/proc.5.html
    pub fn path(&self) -> Option<&str> {
        self.pathname.as_deref()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
