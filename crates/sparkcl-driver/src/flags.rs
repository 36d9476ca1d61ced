//! Memory-object and map flags with the native bit values.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Allocation and access flags for a memory object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemFlags(u64);

impl MemFlags {
    pub const READ_WRITE: MemFlags = MemFlags(1 << 0);
    pub const WRITE_ONLY: MemFlags = MemFlags(1 << 1);
    pub const READ_ONLY: MemFlags = MemFlags(1 << 2);
    pub const USE_HOST_PTR: MemFlags = MemFlags(1 << 3);
    pub const ALLOC_HOST_PTR: MemFlags = MemFlags(1 << 4);
    pub const COPY_HOST_PTR: MemFlags = MemFlags(1 << 5);

    /// Flags that pick how the driver obtains host-visible storage.
    pub const HOST_PTR_MASK: MemFlags =
        MemFlags(Self::USE_HOST_PTR.0 | Self::ALLOC_HOST_PTR.0 | Self::COPY_HOST_PTR.0);

    pub const fn empty() -> Self {
        MemFlags(0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn from_bits(bits: u64) -> Self {
        MemFlags(bits)
    }

    pub const fn contains(self, other: MemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: MemFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn without(self, other: MemFlags) -> Self {
        MemFlags(self.0 & !other.0)
    }
}

impl BitOr for MemFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        MemFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MemFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for MemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MemFlags, &str); 6] = [
            (MemFlags::READ_WRITE, "READ_WRITE"),
            (MemFlags::WRITE_ONLY, "WRITE_ONLY"),
            (MemFlags::READ_ONLY, "READ_ONLY"),
            (MemFlags::USE_HOST_PTR, "USE_HOST_PTR"),
            (MemFlags::ALLOC_HOST_PTR, "ALLOC_HOST_PTR"),
            (MemFlags::COPY_HOST_PTR, "COPY_HOST_PTR"),
        ];
        let set: Vec<&str> =
            NAMES.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, n)| *n).collect();
        if set.is_empty() {
            write!(f, "MemFlags(empty)")
        } else {
            write!(f, "MemFlags({})", set.join(" | "))
        }
    }
}

/// Access requested when mapping a memory object into host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MapFlags(u64);

impl MapFlags {
    pub const READ: MapFlags = MapFlags(1 << 0);
    pub const WRITE: MapFlags = MapFlags(1 << 1);
    pub const WRITE_INVALIDATE_REGION: MapFlags = MapFlags(1 << 2);

    pub const fn empty() -> Self {
        MapFlags(0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: MapFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & (Self::WRITE.0 | Self::WRITE_INVALIDATE_REGION.0) != 0
    }
}

impl BitOr for MapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        MapFlags(self.0 | rhs.0)
    }
}
