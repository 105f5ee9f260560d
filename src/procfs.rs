use std::fs::File;
use std::io::Read;

use bitflags::bitflags;

use crate::{
    error::{ProcMapError, Result},
    page_size,
    retrieve::VmMapSource,
    stack_limit,
    vmentry::{Advice, EntryType, Inheritance, Protection, VmEntry},
};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// VmFlags
//
///////////////////////////////////////////////////////////////////////////////////////////////////

bitflags! {
    /// The subset of the `VmFlags` of `/proc/<PID>/smaps` that records are built from.
    ///
    /// The two-letter codes are documented in [`procfs(5)`].
    ///
    /// [`procfs(5)`]: https://man7.org/linux/man-pages/man5/proc.5.html
    #[derive(Default)]
    struct VmFlags: u32 {
        /// may read
        const MR = 1 << 0;
        /// may write
        const MW = 1 << 1;
        /// may execute
        const ME = 1 << 2;
        /// sequential read advise provided
        const SR = 1 << 3;
        /// random read advise provided
        const RR = 1 << 4;
        /// do not copy area on fork
        const DC = 1 << 5;
        /// wipe on fork
        const WF = 1 << 6;
    }
}

impl VmFlags {
    fn parse(s: &str) -> Self {
        s.split_ascii_whitespace()
            .map(|code| match code {
                "mr" => Self::MR,
                "mw" => Self::MW,
                "me" => Self::ME,
                "sr" => Self::SR,
                "rr" => Self::RR,
                "dc" => Self::DC,
                "wf" => Self::WF,
                _ => Self::empty(),
            })
            .fold(Self::empty(), |acc, f| acc | f)
    }

    fn max_protection(self) -> Protection {
        let mut ret = Protection::empty();
        ret.set(Protection::READ, self.contains(Self::MR));
        ret.set(Protection::WRITE, self.contains(Self::MW));
        ret.set(Protection::EXECUTE, self.contains(Self::ME));
        ret
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// maps/smaps parsing
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Splits off the next whitespace-separated field, returning it along with the remainder.
fn next_field(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(|c: char| c.is_ascii_whitespace()) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

impl std::str::FromStr for VmEntry {
    type Err = ProcMapError;

    /// Parses a line of `/proc/<PID>/maps`, which is also the header of each mapping in
    /// `/proc/<PID>/smaps`.
    fn from_str(s: &str) -> Result<Self> {
        let (region, rest) = next_field(s);
        let (perms, rest) = next_field(rest);
        let (offset, rest) = next_field(rest);
        let (dev, rest) = next_field(rest);
        let (inode, rest) = next_field(rest);
        if inode.is_empty() {
            return Err(ProcMapError::ParseMapsEntry(s.into()));
        }
        if perms.len() != 4 || !perms.is_ascii() {
            return Err(ProcMapError::ParsePermissions(perms.into()));
        }

        let protection: Protection = perms[..3].parse()?;
        let (etype, inheritance) = match &perms[3..] {
            "p" => (EntryType::COPYONWRITE, Inheritance::Copy),
            "s" => (EntryType::empty(), Inheritance::Share),
            _ => return Err(ProcMapError::ParsePermissions(perms.into())),
        };
        let inode: u64 = inode.parse()?;
        let pathname = match rest.trim() {
            "" => None,
            p => Some(p.to_owned()),
        };

        Ok(VmEntry {
            region: region.parse()?,
            offset: u64::from_str_radix(offset, 16)?,
            protection: protection.bits(),
            max_protection: protection.bits(),
            inheritance,
            wired_count: 0,
            advice: Advice::Normal,
            etype: if inode != 0 {
                etype | EntryType::OBJ
            } else {
                etype
            },
            dev: dev.parse()?,
            inode,
            pathname,
        })
    }
}

/// A mapping of `/proc/<PID>/smaps` whose attribute lines are still being read.
#[derive(Debug)]
struct SmapsEntry {
    entry: VmEntry,
    anonymous_kb: u64,
    locked_kb: u64,
    vm_flags: Option<VmFlags>,
}

impl SmapsEntry {
    fn new(entry: VmEntry) -> Self {
        SmapsEntry {
            entry,
            anonymous_kb: 0,
            locked_kb: 0,
            vm_flags: None,
        }
    }

    fn attribute(&mut self, key: &str, value: &str) -> Result<()> {
        let kb = || -> Result<u64> { Ok(next_field(value).0.parse::<u64>()?) };
        match key {
            "Anonymous" => self.anonymous_kb = kb()?,
            "Locked" => self.locked_kb = kb()?,
            "VmFlags" => self.vm_flags = Some(VmFlags::parse(value)),
            _ => {}
        }
        Ok(())
    }

    fn finish(self, page_size: u64) -> VmEntry {
        let mut entry = self.entry;
        if let Some(flags) = self.vm_flags {
            entry.max_protection = flags.max_protection().bits();
            if flags.contains(VmFlags::DC) {
                entry.inheritance = Inheritance::None;
            } else if flags.contains(VmFlags::WF) {
                entry.inheritance = Inheritance::Zero;
            }
            if flags.contains(VmFlags::RR) {
                entry.advice = Advice::Random;
            } else if flags.contains(VmFlags::SR) {
                entry.advice = Advice::Sequential;
            }
        }
        entry.wired_count = self.locked_kb * 1024 / page_size.max(1);
        if entry.etype.contains(EntryType::COPYONWRITE)
            && entry.max_protection & Protection::WRITE.bits() != 0
            && self.anonymous_kb == 0
        {
            entry.etype |= EntryType::NEEDSCOPY;
        }
        entry
    }
}

/// Decodes the full contents of `/proc/<PID>/smaps` into one record per mapping.
///
/// Pathnames are raw bytes as far as the kernel is concerned; any that are not valid UTF-8 are
/// decoded lossily.
pub(crate) fn parse_smaps(raw: &[u8], page_size: u64) -> Result<Vec<VmEntry>> {
    let mut entries = Vec::new();
    let mut current: Option<SmapsEntry> = None;
    for line in raw.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(line);
        if line.trim().is_empty() {
            continue;
        }
        let (first, rest) = next_field(&line);
        if let Some(key) = first.strip_suffix(':') {
            current
                .as_mut()
                .ok_or_else(|| ProcMapError::ParseMapsEntry(line.to_string()))?
                .attribute(key, rest)?;
        } else {
            if let Some(done) = current.take() {
                entries.push(done.finish(page_size));
            }
            current = Some(SmapsEntry::new(line.parse()?));
        }
    }
    entries.extend(current.map(|done| done.finish(page_size)));
    Ok(entries)
}

/// Extracts the top of the stack from the contents of `/proc/<PID>/stat`.
///
/// That is `env_end` (field 52), right below which the environment strings end, or `startstack`
/// (field 28) on kernels that do not report the former.
pub(crate) fn parse_stack_top(path: &str, stat: &[u8]) -> Result<u64> {
    let stat = String::from_utf8_lossy(stat);
    // `comm` may contain spaces and parentheses, so fields are counted from its closing `)`,
    // which is followed by field 3.
    let (_, fields) = stat.rsplit_once(')').ok_or_else(|| ProcMapError::ParseStat {
        path: path.into(),
        reason: "missing command name",
    })?;
    let fields: Vec<_> = fields.split_ascii_whitespace().collect();
    let field = |n: usize| -> Result<Option<u64>> {
        fields
            .get(n - 3)
            .map(|f| f.parse::<u64>().map_err(ProcMapError::from))
            .transpose()
    };
    match (field(52)?, field(28)?) {
        (Some(env_end), _) if env_end != 0 => Ok(env_end),
        (_, Some(startstack)) => Ok(startstack),
        (_, None) => Err(ProcMapError::ParseStat {
            path: path.into(),
            reason: "too few fields",
        }),
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// ProcFs
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A [`VmMapSource`] reading from:
///
/// - `/proc/<PID>/maps`, to estimate the size of the memory map,
/// - `/proc/<PID>/smaps`, to fill in the records, and
/// - `/proc/<PID>/stat`, for the top of the stack.
#[derive(Debug)]
pub struct ProcFs {
    page_size: u64,
}

impl ProcFs {
    /// Construct a new `ProcFs` source.
    pub fn new() -> Result<Self> {
        Ok(ProcFs {
            page_size: page_size()?,
        })
    }

    fn read(path: String) -> Result<Vec<u8>> {
        let mut f = File::open(&path).map_err(|e| ProcMapError::Open {
            path: path.clone(),
            source: e,
        })?;
        let mut buf = Vec::with_capacity(1 << 14);
        f.read_to_end(&mut buf)
            .map_err(|e| ProcMapError::Read { path, source: e })?;
        Ok(buf)
    }
}

impl VmMapSource for ProcFs {
    fn estimate(&mut self, pid: u32) -> Result<usize> {
        let maps = Self::read(format!("/proc/{}/maps", pid))?;
        let lines = maps
            .split(|&b| b == b'\n')
            .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
            .count();
        Ok(lines * VmEntry::RECORD_SIZE)
    }

    fn fill(&mut self, pid: u32, buf: &mut [VmEntry]) -> Result<usize> {
        let smaps = Self::read(format!("/proc/{}/smaps", pid))?;
        let entries = parse_smaps(&smaps, self.page_size)?;
        if entries.len() > buf.len() {
            return Err(ProcMapError::BufferTooSmall {
                capacity: buf.len(),
            });
        }
        let n = entries.len();
        for (slot, entry) in buf.iter_mut().zip(entries) {
            *slot = entry;
        }
        Ok(n)
    }

    fn stack_pointer(&mut self, pid: u32) -> Result<u64> {
        let path = format!("/proc/{}/stat", pid);
        let stat = Self::read(path.clone())?;
        parse_stack_top(&path, &stat)
    }

    fn stack_limit(&mut self) -> Result<u64> {
        stack_limit()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    const SMAPS: &str = "\
55d0c7a00000-55d0c7a28000 r--p 00000000 fe:01 1835087                    /usr/bin/zsh
Size:                160 kB
Rss:                 160 kB
Anonymous:             0 kB
Locked:                0 kB
THPeligible:    0
VmFlags: rd mr mw me dw sd
7f368bc85000-7f368bca7000 r--s 00000000 fe:00 400910                     /usr/share/zsh/functions/Completion/Base.zwc
Size:                136 kB
Anonymous:             0 kB
Locked:                8 kB
VmFlags: rd sh mr me ms rr sd
7f368bcaf000-7f368bcb3000 rw-p 00000000 00:00 0
Size:                 16 kB
Anonymous:            12 kB
Locked:                0 kB
VmFlags: rd wr mr mw me ac dc sd
7ffcec729000-7ffcec784000 rw-p 00000000 00:00 0                          [stack]
Size:                364 kB
Anonymous:            40 kB
VmFlags: rd wr mr mw me gd ac wf
";

    #[test]
    fn test_maps_entry() -> anyhow::Result<()> {
        let maps_entries = vec![
            "7f368bc85000-7f368bca7000 r--s 00000000 fe:00 400910                     /usr/share/zsh/functions/Completion/Base.zwc",
            "7f368bcaf000-7f368bcb3000 rw-p 00000000 00:00 0",
            "7f368bcc2000-7f368bcc3000 ---p 0000f000 fe:00 13377416                   /usr/lib/x86_64-linux-gnu/zsh/5.7.1/zsh/complist.so",
            "7ffcec729000-7ffcec784000 rw-p 00000000 00:00 0                          [stack]",
            "7ffcec7d1000-7ffcec7d3000 r-xp 00000000 00:00 0                          [vdso]",
        ];
        let entries = maps_entries
            .iter()
            .map(|line| line.parse::<VmEntry>())
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(entries[0].protection(), 1);
        assert_eq!(entries[0].inheritance(), Inheritance::Share);
        assert_eq!(entries[0].entry_type(), EntryType::OBJ);
        assert_eq!(entries[0].device_numbers().major(), 0xfe);

        assert_eq!(entries[1].entry_type(), EntryType::COPYONWRITE);
        assert_eq!(entries[1].path(), None);

        assert_eq!(entries[2].offset(), 0xf000);
        assert_eq!(entries[2].protection(), 0);
        assert!(entries[2].entry_type().contains(EntryType::OBJ));

        assert_eq!(entries[3].path(), Some("[stack]"));
        assert_eq!(entries[4].protection(), 5);
        Ok(())
    }

    #[test]
    fn test_maps_entry_path_with_spaces() -> anyhow::Result<()> {
        let entry: VmEntry =
            "7f0000000000-7f0000001000 rw-s 00000000 00:01 4128  /memfd:doublemapper (deleted)"
                .parse()?;
        assert_eq!(entry.path(), Some("/memfd:doublemapper (deleted)"));
        Ok(())
    }

    #[test]
    fn test_invalid_maps_entry() {
        for line in &[
            "",
            "7f0000000000-7f0000001000 rw-p 00000000 00:00",
            "7f0000000000-7f0000001000 rw-x 00000000 00:00 0",
            "7f0000000000-7f0000001000 rw 00000000 00:00 0",
            "nothex-7f0000001000 rw-p 00000000 00:00 0",
        ] {
            assert!(line.parse::<VmEntry>().is_err(), "{:?} should not parse", line);
        }
    }

    #[test]
    fn test_parse_smaps() -> anyhow::Result<()> {
        let entries = parse_smaps(SMAPS.as_bytes(), 4096)?;
        assert_eq!(entries.len(), 4);

        // Read-only private file mapping that may become writable: nothing copied yet.
        let text = &entries[0];
        assert_eq!(text.protection(), 1);
        assert_eq!(text.max_protection(), 7);
        assert_eq!(
            text.entry_type(),
            EntryType::OBJ | EntryType::COPYONWRITE | EntryType::NEEDSCOPY
        );

        let shared = &entries[1];
        assert_eq!(shared.max_protection(), 5);
        assert_eq!(shared.inheritance(), Inheritance::Share);
        assert_eq!(shared.advice(), Advice::Random);
        assert_eq!(shared.wired_count(), 2);

        let anon = &entries[2];
        assert_eq!(anon.entry_type(), EntryType::COPYONWRITE);
        assert_eq!(anon.inheritance(), Inheritance::None);

        let stack = &entries[3];
        assert_eq!(stack.inheritance(), Inheritance::Zero);
        assert_eq!(stack.memory_region().size_kb(), 364);
        Ok(())
    }

    #[test]
    fn test_parse_smaps_orphan_attribute() {
        assert!(parse_smaps(b"Size: 4 kB\n", 4096).is_err());
    }

    #[test]
    fn test_parse_smaps_non_utf8_path() -> anyhow::Result<()> {
        let smaps: &[u8] = b"\
7f368bc85000-7f368bca7000 r--p 00000000 fe:00 400910                     /tmp/map_\xff\xfe.bin
Size:                136 kB
VmFlags: rd mr mw me
7f368bcaf000-7f368bcb3000 rw-p 00000000 00:00 0
Size:                 16 kB
VmFlags: rd wr mr mw me
";
        let entries = parse_smaps(smaps, 4096)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path(), Some("/tmp/map_\u{fffd}\u{fffd}.bin"));
        assert_eq!(entries[0].inode(), 400910);
        assert_eq!(entries[1].path(), None);
        Ok(())
    }

    fn stat_line(startstack: &str, env_end: Option<&str>) -> String {
        // Fields 3 up to 28 or 52.
        let mut fields = vec!["0"; if env_end.is_some() { 50 } else { 26 }];
        fields[0] = "S";
        fields[25] = startstack;
        if let Some(env_end) = env_end {
            fields[49] = env_end;
        }
        format!("4242 (my (weird) cmd) {}", fields.join(" "))
    }

    #[test]
    fn test_parse_stack_top() -> anyhow::Result<()> {
        let stat = stat_line("140731234567888", Some("140731234574303"));
        assert_eq!(parse_stack_top("stat", stat.as_bytes())?, 140_731_234_574_303);

        // Older kernels, or `env_end` hidden from us.
        let stat = stat_line("140731234567888", None);
        assert_eq!(parse_stack_top("stat", stat.as_bytes())?, 140_731_234_567_888);
        let stat = stat_line("140731234567888", Some("0"));
        assert_eq!(parse_stack_top("stat", stat.as_bytes())?, 140_731_234_567_888);

        // `comm` is whatever bytes the process named itself with.
        let mut stat = b"4242 (\xff\xfe".to_vec();
        stat.extend_from_slice(&stat_line("140731234567888", None).as_bytes()[6..]);
        assert_eq!(parse_stack_top("stat", &stat)?, 140_731_234_567_888);

        assert!(parse_stack_top("stat", b"4242 (cmd) S 1").is_err());
        assert!(parse_stack_top("stat", b"no parentheses here").is_err());
        assert!(parse_stack_top("stat", stat_line("nope", None).as_bytes()).is_err());
        Ok(())
    }

    #[test]
    fn test_self() -> anyhow::Result<()> {
        let pid = std::process::id();
        let mut src = ProcFs::new()?;

        let estimate = src.estimate(pid)?;
        assert!(estimate > 0);
        assert_eq!(estimate % VmEntry::RECORD_SIZE, 0);

        // Leave some room for mappings created in between.
        let mut buf = vec![VmEntry::default(); estimate / VmEntry::RECORD_SIZE + 64];
        let n = src.fill(pid, &mut buf)?;
        assert!(n > 0);
        assert!(buf[..n]
            .windows(2)
            .all(|w| w[0].memory_region().start_address() < w[1].memory_region().start_address()));

        // The environment strings live in the mapping right below the top of the stack.
        let top = src.stack_pointer(pid)?;
        assert!(buf[..n].iter().any(|e| {
            let r = e.memory_region();
            r.start_address() < top && top <= r.end_address()
        }));

        assert!(src.stack_limit()? > 0);
        Ok(())
    }

    #[test]
    fn test_self_non_utf8_mapping() -> anyhow::Result<()> {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt, os::unix::io::AsRawFd, ptr};

        let mut name = format!("procmap_{}_", std::process::id()).into_bytes();
        name.extend_from_slice(b"\xff\xfe.bin");
        let path = std::env::temp_dir().join(OsStr::from_bytes(&name));
        let file = File::create(&path)?;
        file.set_len(4096)?;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                4096,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);

        let res = crate::Retriever::new(ProcFs::new()?)?.snapshot(std::process::id());
        unsafe { libc::munmap(addr, 4096) };
        std::fs::remove_file(&path)?;

        let snap = res?;
        let entry = snap
            .entries()
            .iter()
            .find(|e| e.memory_region().start_address() == addr as u64)
            .expect("mapping not listed");
        let mapped = entry.path().expect("mapping has no path");
        assert!(mapped.ends_with(&format!("procmap_{}_\u{fffd}\u{fffd}.bin", std::process::id())));
        Ok(())
    }

    #[test]
    fn test_fill_too_small() -> anyhow::Result<()> {
        let mut src = ProcFs::new()?;
        let mut buf = vec![VmEntry::default(); 1];
        match src.fill(std::process::id(), &mut buf) {
            Err(ProcMapError::BufferTooSmall { capacity }) => assert_eq!(capacity, 1),
            other => panic!("expected BufferTooSmall, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_missing_process() {
        let mut src = ProcFs::new().unwrap();
        assert!(matches!(
            src.estimate(999_999_999),
            Err(ProcMapError::Open { .. })
        ));
    }
}
