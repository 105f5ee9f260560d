//! Display the virtual memory map of running processes, in the spirit of Solaris' `pmap(1)`.
//!
//! The memory map of a process is retrieved through a [`VmMapSource`] (on Linux, [`ProcFs`]) by
//! a [`Retriever`], which copes with the map growing while it is being read. Each entry of the
//! resulting [`ProcessSnapshot`] is told apart as stack, object-backed, hole or anonymous memory
//! by [`RegionKind::classify`], and the whole of it is laid out as a table by [`dump`].

#![doc(html_root_url = "https://docs.rs/procmap/0.1.0")]
#![warn(rust_2018_idioms)]
#![deny(
    //missing_docs,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
)]

mod classify;
mod display;
mod error;
mod procfs;
mod retrieve;
mod vmentry;

pub use classify::RegionKind;
pub use display::{dump, DisplayMode};
pub use error::{ProcMapError, Result};
pub use procfs::ProcFs;
pub use retrieve::{ProcessSnapshot, Retriever, VmMapSource};
pub use vmentry::{
    Advice, DeviceNumbers, EntryType, Inheritance, MemoryRegion, Protection, ProtectionClass,
    VmEntry,
};

pub fn page_size() -> Result<u64> {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => Err(std::io::Error::last_os_error().into()),
        sz => Ok(sz as u64),
    }
}

/// Rounds `addr` up to the next multiple of `page_size`, which must be a power of two.
pub fn round_page(addr: u64, page_size: u64) -> u64 {
    let mask = page_size - 1;
    addr.wrapping_add(mask) & !mask
}

/// Returns the soft limit on the stack size of the calling process, or `u64::MAX` if there is
/// none.
pub fn stack_limit() -> Result<u64> {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut rl) } != 0 {
        return Err(ProcMapError::ResourceLimit(std::io::Error::last_os_error()));
    }
    Ok(if rl.rlim_cur == libc::RLIM_INFINITY {
        u64::MAX
    } else {
        rl.rlim_cur as u64
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_page() {
        assert_eq!(round_page(0, 4096), 0);
        assert_eq!(round_page(1, 4096), 4096);
        assert_eq!(round_page(4096, 4096), 4096);
        assert_eq!(round_page(0x7fff_0000_0123, 4096), 0x7fff_0000_1000);
        assert_eq!(round_page(0x1001, 0x4000), 0x4000);
    }

    #[test]
    fn test_page_size() -> anyhow::Result<()> {
        let sz = page_size()?;
        assert!(sz.is_power_of_two());
        Ok(())
    }

    #[test]
    fn test_stack_limit() -> anyhow::Result<()> {
        assert!(stack_limit()? > 0);
        Ok(())
    }
}
