//! Closed set of recorded operations

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of leading columns on every data line:
/// thread id, time, frame index, operation name
pub const HEADER_COLUMNS: usize = 4;

/// Accepted argument count range for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: usize,
    /// The last column is free text that may itself contain commas
    pub trailing_text: bool,
}

impl Arity {
    const fn exact(count: usize) -> Self {
        Self {
            min: count,
            max: count,
            trailing_text: false,
        }
    }

    /// Trailing user-data/name column that older recordings may omit
    const fn with_optional_text(count: usize) -> Self {
        Self {
            min: count,
            max: count + 1,
            trailing_text: true,
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        self.min <= count && count <= self.max
    }

    /// Field limit for splitting the argument columns. Without a text
    /// column one extra field is kept apart so surplus columns are counted.
    pub fn split_limit(&self) -> usize {
        if self.trailing_text {
            self.max
        } else {
            self.max + 1
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}..{}", self.min, self.max)
        }
    }
}

macro_rules! operations {
    ($($variant:ident => $arity:expr),* $(,)?) => {
        /// Every operation the replayer understands
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum Operation {
            $($variant),*
        }

        impl Operation {
            pub const ALL: &'static [Operation] = &[$(Operation::$variant),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Operation::$variant => stringify!($variant)),*
                }
            }

            /// Arguments after the header columns
            pub fn arity(self) -> Arity {
                match self {
                    $(Operation::$variant => $arity),*
                }
            }
        }
    };
}

operations! {
    CreateAllocator => Arity::exact(0),
    DestroyAllocator => Arity::exact(0),
    SetCurrentFrameIndex => Arity::exact(1),
    CreatePool => Arity::exact(7),
    DestroyPool => Arity::exact(1),
    SetPoolName => Arity::with_optional_text(1),
    MakePoolAllocationsLost => Arity::exact(1),
    AllocateMemory => Arity::with_optional_text(10),
    AllocateMemoryPages => Arity::with_optional_text(10),
    AllocateMemoryForBuffer => Arity::with_optional_text(12),
    AllocateMemoryForImage => Arity::with_optional_text(12),
    CreateBuffer => Arity::with_optional_text(11),
    CreateImage => Arity::with_optional_text(20),
    CreateLostAllocation => Arity::exact(1),
    FreeMemory => Arity::exact(1),
    FreeMemoryPages => Arity::exact(1),
    DestroyBuffer => Arity::exact(1),
    DestroyImage => Arity::exact(1),
    SetAllocationUserData => Arity::with_optional_text(1),
    MapMemory => Arity::exact(1),
    UnmapMemory => Arity::exact(1),
    FlushAllocation => Arity::exact(3),
    InvalidateAllocation => Arity::exact(3),
    TouchAllocation => Arity::exact(1),
    GetAllocationInfo => Arity::exact(1),
    ResizeAllocation => Arity::exact(2),
    DefragmentationBegin => Arity::exact(9),
    DefragmentationEnd => Arity::exact(1),
}

impl Operation {
    /// Resolve a recorded operation name. The `vma` prefix used by some
    /// recorders is accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        let name = name.strip_prefix("vma").unwrap_or(name);
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
