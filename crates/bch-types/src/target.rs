//! Compact target encoding.
//!
//! A target selects either a single device or a disk group. Options and
//! superblock fields store it as a `u32` whose high bits carry the
//! kind, so zero remains "no target".

use serde::{Deserialize, Serialize};
use std::fmt;

const TARGET_KIND_SHIFT: u32 = 30;
const TARGET_KIND_DEV: u32 = 1;
const TARGET_KIND_GROUP: u32 = 2;
const TARGET_VALUE_MASK: u32 = (1 << TARGET_KIND_SHIFT) - 1;

/// A resolved write/read placement target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    #[default]
    None,
    Device(u32),
    Group(u32),
}

impl Target {
    /// Encode into the compact on-disk form.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Device(idx) => (TARGET_KIND_DEV << TARGET_KIND_SHIFT) | (idx & TARGET_VALUE_MASK),
            Self::Group(idx) => (TARGET_KIND_GROUP << TARGET_KIND_SHIFT) | (idx & TARGET_VALUE_MASK),
        }
    }

    /// Decode from the compact on-disk form. Unknown kinds decode to
    /// `None` so that a newer format does not brick an older reader.
    #[must_use]
    pub fn from_u32(v: u32) -> Self {
        let value = v & TARGET_VALUE_MASK;
        match v >> TARGET_KIND_SHIFT {
            TARGET_KIND_DEV => Self::Device(value),
            TARGET_KIND_GROUP => Self::Group(value),
            _ => Self::None,
        }
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Device(idx) => write!(f, "device {idx}"),
            Self::Group(idx) => write!(f, "group {idx}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for t in [Target::None, Target::Device(0), Target::Device(7), Target::Group(3)] {
            assert_eq!(Target::from_u32(t.to_u32()), t);
        }
    }

    #[test]
    fn none_is_zero() {
        assert_eq!(Target::None.to_u32(), 0);
        assert_eq!(Target::from_u32(0), Target::None);
    }

    #[test]
    fn unknown_kind_decodes_to_none() {
        assert_eq!(Target::from_u32(3 << 30), Target::None);
    }
}
