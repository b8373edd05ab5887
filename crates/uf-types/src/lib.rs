#![forbid(unsafe_code)]
//! Identity newtypes shared by the Unfound cache and notification cores.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block size used by the reference exercises (one page).
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Mounted volume identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub u32);

/// Logical block number within a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Whether `self` immediately follows `prev`.
    #[must_use]
    pub fn follows(self, prev: Self) -> bool {
        prev.0.checked_add(1) == Some(self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol{}", self.0)
    }
}

/// Open file handle, the unit the access-pattern classifier tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

/// Owner of a watch (the notification handle that registered it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

/// Watch descriptor returned by `add_watch`. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WatchDescriptor(pub u64);

impl fmt::Display for WatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd{}", self.0)
    }
}

/// Filesystem node identity (inode number) of a resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return None;
        }
        Some(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> BlockNumber {
        BlockNumber(byte_offset >> u64::from(self.shift()))
    }

    /// Offset of `byte_offset` inside its block.
    #[must_use]
    pub fn offset_in_block(self, byte_offset: u64) -> usize {
        // Always < 65536, fits in usize.
        (byte_offset & u64::from(self.0 - 1)) as usize
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

bitflags! {
    /// Set of mutation kinds a watch cares about.
    ///
    /// The low three bits match the `IN_CREATE`/`IN_MODIFY`/`IN_DELETE`
    /// values the user-space exercises pass to `notify_add_watch`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventMask: u32 {
        const CREATE = 1;
        const MODIFY = 1 << 1;
        const DELETE = 1 << 2;
        const ACCESS = 1 << 3;
        const RENAME = 1 << 4;
    }
}

impl EventMask {
    /// Parse a comma-separated list of kind names (`create,modify`).
    ///
    /// `all` selects every kind. Returns `None` on an unknown name.
    #[must_use]
    pub fn from_names(list: &str) -> Option<Self> {
        let mut mask = Self::empty();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            mask |= match name.to_ascii_lowercase().as_str() {
                "create" => Self::CREATE,
                "modify" => Self::MODIFY,
                "delete" => Self::DELETE,
                "access" => Self::ACCESS,
                "rename" => Self::RENAME,
                "all" => Self::all(),
                _ => return None,
            };
        }
        Some(mask)
    }
}
