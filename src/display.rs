use std::convert::TryFrom;
use std::io::Write;

use crate::{
    classify::RegionKind,
    error::Result,
    retrieve::ProcessSnapshot,
    vmentry::{EntryType, ProtectionClass, VmEntry},
};

/// Width of an address printed in full.
const ADDR_WIDTH: usize = std::mem::size_of::<usize>() * 2;

/// How the memory map is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    /// Start address, size and protection, like Solaris' `pmap(1)`.
    Solaris,
    /// Every attribute of each entry, under a header row.
    All,
    /// Like `/proc/<PID>/maps`.
    Linux,
}

impl Default for DisplayMode {
    fn default() -> Self {
        Self::Solaris
    }
}

impl DisplayMode {
    /// The header row, if the layout has one.
    pub fn header(self) -> Option<String> {
        match self {
            Self::All => Some(format!(
                "{:<w$} {:<w$} {:>8} {:<w$} rwxpc  RWX  I/W/A Dev  {:>8} - File",
                "Start",
                "End",
                "Size ",
                "Offset",
                "Inode",
                w = ADDR_WIDTH,
            )),
            Self::Solaris | Self::Linux => None,
        }
    }

    /// The fixed fields of a row, which the [`RegionKind`] label is appended to.
    ///
    /// # Errors
    ///
    /// Fails with [`ProcMapError::UnknownProtection`] if a protection of the entry has bits beyond
    /// `rwx` and the layout needs to name it.
    ///
    /// [`ProcMapError::UnknownProtection`]: enum.ProcMapError.html#variant.UnknownProtection
    pub fn fields(self, entry: &VmEntry) -> Result<String> {
        let region = entry.memory_region();
        let etype = entry.entry_type();
        Ok(match self {
            Self::All => format!(
                "{:0w$x}-{:0w$x} {:7}k {:0w$x} {}{}{} ({}) {}/{}/{} {:02}:{:02} {:7} - ",
                region.start_address(),
                region.last_address(),
                region.size_kb(),
                entry.offset(),
                ProtectionClass::try_from(entry.protection())?.rwx(),
                if etype.contains(EntryType::COPYONWRITE) { 'p' } else { 's' },
                if etype.contains(EntryType::NEEDSCOPY) { '+' } else { '-' },
                ProtectionClass::try_from(entry.max_protection())?.rwx(),
                entry.inheritance() as u8,
                entry.wired_count(),
                entry.advice() as u8,
                // Device and inode are not looked up in this layout.
                0,
                0,
                0,
                w = ADDR_WIDTH,
            ),
            Self::Solaris => format!(
                "{:0w$X} {:6}K {:<15}   ",
                region.start_address(),
                region.size_kb(),
                ProtectionClass::try_from(entry.protection())?.words(),
                w = ADDR_WIDTH,
            ),
            Self::Linux => format!(
                "{:0w$x}-{:0w$x} {}{} {:08x} {} {:<10} {}",
                region.start_address(),
                region.end_address(),
                entry.permissions(),
                if etype.contains(EntryType::COPYONWRITE) { 'p' } else { 's' },
                entry.offset(),
                entry.device_numbers(),
                entry.inode(),
                entry.path().unwrap_or(""),
                w = ADDR_WIDTH,
            ),
        })
    }

    /// The summary row.
    pub fn total(self, total_kb: u64) -> String {
        match self {
            Self::All => format!("{:<w$} {:9}k", " total", total_kb, w = ADDR_WIDTH * 2 - 1),
            Self::Solaris | Self::Linux => {
                format!("{:<w$} {:8}k", " total", total_kb, w = ADDR_WIDTH - 2)
            }
        }
    }
}

/// Writes the memory map in `snap` to `out`, laid out according to `mode`, and returns the total
/// size in kilobytes of the entries that have any protection.
pub fn dump<W: Write>(out: &mut W, snap: &ProcessSnapshot, mode: DisplayMode) -> Result<u64> {
    if let Some(header) = mode.header() {
        writeln!(out, "{}", header)?;
    }

    let mut total = 0;
    for entry in snap.entries() {
        let kind = RegionKind::classify(entry, snap.stack_pointer(), snap.stack_limit());
        writeln!(out, "{}  {}", mode.fields(entry)?, kind)?;
        if entry.protection() != 0 {
            total += entry.memory_region().size();
        }
    }

    writeln!(out, "{}", mode.total(total / 1024))?;
    Ok(total / 1024)
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
