use std::fmt;

use crate::vmentry::{EntryType, VmEntry};

/// What a memory map entry is used for, as far as the table is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Stack,
    Obj,
    Hole,
    Anon,
}

impl RegionKind {
    /// Classify `entry`, given the page-rounded stack pointer of its process and the assumed size
    /// of its stack.
    ///
    /// The first match wins: an entry lying within `[sp - stack_size, sp]` is the stack whatever
    /// its type flags say; otherwise it is an object, a hole, or anonymous memory, in that order.
    pub fn classify(entry: &VmEntry, sp: u64, stack_size: u64) -> Self {
        let region = entry.memory_region();
        if region.start_address() >= sp.saturating_sub(stack_size) && region.end_address() <= sp {
            Self::Stack
        } else if entry.entry_type().contains(EntryType::OBJ) {
            Self::Obj
        } else if entry.entry_type().contains(EntryType::HOLE) {
            Self::Hole
        } else {
            Self::Anon
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Stack => "stack",
            Self::Obj => "obj",
            Self::Hole => "hole",
            Self::Anon => "anon",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ {} ]", self.label())
    }
}
