//! Option metadata and the typed option bag.
//!
//! Every option the core recognizes has a metadata row: name, kind,
//! scope mask, choices, and default. The CLI and the xattr surface both
//! resolve option names through [`OPT_TABLE`]; the typed [`Opts`] bag
//! tracks which options were explicitly set so formatting can tell a
//! default apart from a user choice.

use crate::{Target, TypeError, parse_data_allowed};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Enumerated option values ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChecksumType {
    None = 0,
    #[default]
    Crc32c = 1,
    Crc64 = 2,
    Xxh3 = 3,
    Poly1305 = 4,
}

impl ChecksumType {
    pub fn from_u8(v: u8) -> Result<Self, TypeError> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Crc32c),
            2 => Ok(Self::Crc64),
            3 => Ok(Self::Xxh3),
            4 => Ok(Self::Poly1305),
            _ => Err(TypeError::InvalidOpt {
                opt: "checksum_type",
                reason: format!("unknown value {v}"),
            }),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Crc32c => "crc32c",
            Self::Crc64 => "crc64",
            Self::Xxh3 => "xxh3",
            Self::Poly1305 => "poly1305",
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionType {
    #[default]
    None = 0,
    Lz4 = 1,
    Gzip = 2,
    Zstd = 3,
}

impl CompressionType {
    pub fn from_u8(v: u8) -> Result<Self, TypeError> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Gzip),
            3 => Ok(Self::Zstd),
            _ => Err(TypeError::InvalidOpt {
                opt: "compression",
                reason: format!("unknown value {v}"),
            }),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncryptionType {
    #[default]
    None = 0,
    Chacha20Poly1305 = 1,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorAction {
    Continue = 0,
    #[default]
    RemountRo = 1,
    Panic = 2,
}

impl ErrorAction {
    pub fn from_u8(v: u8) -> Result<Self, TypeError> {
        match v {
            0 => Ok(Self::Continue),
            1 => Ok(Self::RemountRo),
            2 => Ok(Self::Panic),
            _ => Err(TypeError::InvalidOpt {
                opt: "error_action",
                reason: format!("unknown value {v}"),
            }),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::RemountRo => "remount_ro",
            Self::Panic => "panic",
        }
    }
}

// ── Option metadata ─────────────────────────────────────────────────────────

/// Value kind of an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptKind {
    Bool,
    Unsigned,
    Str,
    Enum(&'static [&'static str]),
    /// Resolved by a function with filesystem context (targets).
    Func,
}

/// Where an option may be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptScope(pub u8);

impl OptScope {
    pub const FORMAT: Self = Self(1 << 0);
    pub const MOUNT: Self = Self(1 << 1);
    pub const RUNTIME: Self = Self(1 << 2);
    pub const INODE: Self = Self(1 << 3);
    pub const DEVICE: Self = Self(1 << 4);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// One row of the option table.
#[derive(Debug, Clone, Copy)]
pub struct OptMeta {
    pub name: &'static str,
    pub kind: OptKind,
    pub scope: OptScope,
    pub default: &'static str,
}

const FMR: OptScope = OptScope::FORMAT.union(OptScope::MOUNT).union(OptScope::RUNTIME);
const FMRI: OptScope = FMR.union(OptScope::INODE);

pub const CSUM_CHOICES: &[&str] = &["none", "crc32c", "crc64", "xxh3"];
pub const COMPRESSION_CHOICES: &[&str] = &["none", "lz4", "gzip", "zstd"];
pub const ENCRYPTION_CHOICES: &[&str] = &["none", "chacha20_poly1305"];
pub const ERROR_ACTION_CHOICES: &[&str] = &["continue", "remount_ro", "panic"];

/// Static option table. Order is the stable option id used when an
/// option value is persisted in the superblock.
pub const OPT_TABLE: &[OptMeta] = &[
    OptMeta {
        name: "block_size",
        kind: OptKind::Unsigned,
        scope: OptScope::FORMAT,
        default: "0",
    },
    OptMeta {
        name: "btree_node_size",
        kind: OptKind::Unsigned,
        scope: OptScope::FORMAT,
        default: "262144",
    },
    OptMeta {
        name: "metadata_replicas",
        kind: OptKind::Unsigned,
        scope: FMR,
        default: "1",
    },
    OptMeta {
        name: "data_replicas",
        kind: OptKind::Unsigned,
        scope: FMRI,
        default: "1",
    },
    OptMeta {
        name: "metadata_checksum_type",
        kind: OptKind::Enum(CSUM_CHOICES),
        scope: FMR,
        default: "crc32c",
    },
    OptMeta {
        name: "data_checksum_type",
        kind: OptKind::Enum(CSUM_CHOICES),
        scope: FMRI,
        default: "crc32c",
    },
    OptMeta {
        name: "compression",
        kind: OptKind::Enum(COMPRESSION_CHOICES),
        scope: FMRI,
        default: "none",
    },
    OptMeta {
        name: "encryption",
        kind: OptKind::Enum(ENCRYPTION_CHOICES),
        scope: OptScope::FORMAT,
        default: "none",
    },
    OptMeta {
        name: "foreground_target",
        kind: OptKind::Func,
        scope: FMRI,
        default: "",
    },
    OptMeta {
        name: "background_target",
        kind: OptKind::Func,
        scope: FMRI,
        default: "",
    },
    OptMeta {
        name: "promote_target",
        kind: OptKind::Func,
        scope: FMRI,
        default: "",
    },
    OptMeta {
        name: "metadata_target",
        kind: OptKind::Func,
        scope: FMR,
        default: "",
    },
    OptMeta {
        name: "error_action",
        kind: OptKind::Enum(ERROR_ACTION_CHOICES),
        scope: FMR,
        default: "remount_ro",
    },
    OptMeta {
        name: "gc_reserve_percent",
        kind: OptKind::Unsigned,
        scope: OptScope::FORMAT.union(OptScope::MOUNT),
        default: "8",
    },
    OptMeta {
        name: "discard",
        kind: OptKind::Bool,
        scope: OptScope::DEVICE,
        default: "false",
    },
    OptMeta {
        name: "durability",
        kind: OptKind::Unsigned,
        scope: OptScope::DEVICE,
        default: "1",
    },
    OptMeta {
        name: "data_allowed",
        kind: OptKind::Str,
        scope: OptScope::DEVICE,
        default: "journal,btree,user,parity",
    },
];

/// Look up an option row by name.
pub fn opt_lookup(name: &str) -> Result<&'static OptMeta, TypeError> {
    OPT_TABLE
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| TypeError::NoSuchOpt {
            opt: name.to_owned(),
        })
}

/// Option names that may be overridden per inode (the §6.5 xattr
/// surface exposes exactly these under the `bcachefs.` prefix).
pub fn inode_opt_names() -> impl Iterator<Item = &'static str> {
    OPT_TABLE
        .iter()
        .filter(|m| m.scope.contains(OptScope::INODE))
        .map(|m| m.name)
}

// ── Typed option bag ────────────────────────────────────────────────────────

/// Filesystem-wide options. `None` means "not explicitly set"; accessors
/// fall back to the table default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opts {
    pub block_size: Option<u32>,
    pub btree_node_size: Option<u32>,
    pub metadata_replicas: Option<u8>,
    pub data_replicas: Option<u8>,
    pub metadata_checksum_type: Option<ChecksumType>,
    pub data_checksum_type: Option<ChecksumType>,
    pub compression: Option<CompressionType>,
    pub encryption: Option<EncryptionType>,
    pub foreground_target: Option<Target>,
    pub background_target: Option<Target>,
    pub promote_target: Option<Target>,
    pub metadata_target: Option<Target>,
    pub error_action: Option<ErrorAction>,
    pub gc_reserve_percent: Option<u8>,
}

impl Opts {
    #[must_use]
    pub fn metadata_replicas(&self) -> u8 {
        self.metadata_replicas.unwrap_or(1)
    }

    #[must_use]
    pub fn data_replicas(&self) -> u8 {
        self.data_replicas.unwrap_or(1)
    }

    #[must_use]
    pub fn metadata_checksum_type(&self) -> ChecksumType {
        self.metadata_checksum_type.unwrap_or_default()
    }

    #[must_use]
    pub fn data_checksum_type(&self) -> ChecksumType {
        self.data_checksum_type.unwrap_or_default()
    }

    #[must_use]
    pub fn compression(&self) -> CompressionType {
        self.compression.unwrap_or_default()
    }

    #[must_use]
    pub fn encryption(&self) -> EncryptionType {
        self.encryption.unwrap_or_default()
    }

    #[must_use]
    pub fn error_action(&self) -> ErrorAction {
        self.error_action.unwrap_or_default()
    }

    #[must_use]
    pub fn gc_reserve_percent(&self) -> u8 {
        self.gc_reserve_percent.unwrap_or(8)
    }

    #[must_use]
    pub fn btree_node_size(&self) -> u32 {
        self.btree_node_size.unwrap_or(crate::BTREE_NODE_SIZE_DEFAULT)
    }

    #[must_use]
    pub fn foreground_target(&self) -> Target {
        self.foreground_target.unwrap_or(Target::None)
    }

    #[must_use]
    pub fn background_target(&self) -> Target {
        self.background_target.unwrap_or(Target::None)
    }

    #[must_use]
    pub fn promote_target(&self) -> Target {
        self.promote_target.unwrap_or(Target::None)
    }

    #[must_use]
    pub fn metadata_target(&self) -> Target {
        self.metadata_target.unwrap_or(Target::None)
    }

    /// Set one option from its string form. Target-valued options are
    /// not handled here — they need filesystem context to resolve, so
    /// callers route `OptKind::Func` rows through the superblock
    /// manager's target parser first.
    pub fn set_by_name(&mut self, name: &str, value: &str) -> Result<(), TypeError> {
        let meta = opt_lookup(name)?;
        let invalid = |reason: String| TypeError::InvalidOpt {
            opt: meta.name,
            reason,
        };

        match name {
            "block_size" => {
                let v = parse_unsigned(meta, value)?;
                let v = u32::try_from(v).map_err(|_| invalid("too large".into()))?;
                if !v.is_power_of_two() || v < crate::SECTOR_SIZE {
                    return Err(invalid("must be a power of two >= 512".into()));
                }
                self.block_size = Some(v);
            }
            "btree_node_size" => {
                let v = parse_unsigned(meta, value)?;
                let v = u32::try_from(v).map_err(|_| invalid("too large".into()))?;
                if !v.is_power_of_two() {
                    return Err(invalid("must be a power of two".into()));
                }
                self.btree_node_size = Some(v);
            }
            "metadata_replicas" => {
                self.metadata_replicas = Some(parse_replicas(meta, value)?);
            }
            "data_replicas" => {
                self.data_replicas = Some(parse_replicas(meta, value)?);
            }
            "metadata_checksum_type" => {
                self.metadata_checksum_type = Some(parse_csum(meta, value)?);
            }
            "data_checksum_type" => {
                self.data_checksum_type = Some(parse_csum(meta, value)?);
            }
            "compression" => {
                self.compression = Some(match value {
                    "none" => CompressionType::None,
                    "lz4" => CompressionType::Lz4,
                    "gzip" => CompressionType::Gzip,
                    "zstd" => CompressionType::Zstd,
                    _ => return Err(invalid(format!("unknown compression {value:?}"))),
                });
            }
            "encryption" => {
                self.encryption = Some(match value {
                    "none" => EncryptionType::None,
                    "chacha20_poly1305" => EncryptionType::Chacha20Poly1305,
                    _ => return Err(invalid(format!("unknown encryption {value:?}"))),
                });
            }
            "error_action" => {
                self.error_action = Some(match value {
                    "continue" => ErrorAction::Continue,
                    "remount_ro" => ErrorAction::RemountRo,
                    "panic" => ErrorAction::Panic,
                    _ => return Err(invalid(format!("unknown error action {value:?}"))),
                });
            }
            "gc_reserve_percent" => {
                let v = parse_unsigned(meta, value)?;
                if !(5..=50).contains(&v) {
                    return Err(invalid("must be in 5..=50".into()));
                }
                #[allow(clippy::cast_possible_truncation)]
                {
                    self.gc_reserve_percent = Some(v as u8);
                }
            }
            _ => {
                return Err(TypeError::InvalidOpt {
                    opt: meta.name,
                    reason: "not settable without filesystem context".into(),
                });
            }
        }
        Ok(())
    }
}

fn parse_unsigned(meta: &OptMeta, value: &str) -> Result<u64, TypeError> {
    value.parse::<u64>().map_err(|_| TypeError::InvalidOpt {
        opt: meta.name,
        reason: format!("expected unsigned integer, got {value:?}"),
    })
}

fn parse_replicas(meta: &OptMeta, value: &str) -> Result<u8, TypeError> {
    let v = parse_unsigned(meta, value)?;
    if !(1..=4).contains(&v) {
        return Err(TypeError::InvalidOpt {
            opt: meta.name,
            reason: "replicas must be in 1..=4".into(),
        });
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(v as u8)
}

fn parse_csum(meta: &OptMeta, value: &str) -> Result<ChecksumType, TypeError> {
    match value {
        "none" => Ok(ChecksumType::None),
        "crc32c" => Ok(ChecksumType::Crc32c),
        "crc64" => Ok(ChecksumType::Crc64),
        "xxh3" => Ok(ChecksumType::Xxh3),
        _ => Err(TypeError::InvalidOpt {
            opt: meta.name,
            reason: format!("unknown checksum type {value:?}"),
        }),
    }
}

/// Per-device options supplied at format or device-add time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevOpts {
    pub discard: bool,
    pub durability: u8,
    pub data_allowed: u8,
    pub group: Option<String>,
}

impl Default for DevOpts {
    fn default() -> Self {
        Self {
            discard: false,
            durability: 1,
            data_allowed: crate::data_allowed_default(),
            group: None,
        }
    }
}

impl DevOpts {
    pub fn set_by_name(&mut self, name: &str, value: &str) -> Result<(), TypeError> {
        match name {
            "discard" => {
                self.discard = match value {
                    "true" | "1" | "" => true,
                    "false" | "0" => false,
                    _ => {
                        return Err(TypeError::InvalidOpt {
                            opt: "discard",
                            reason: format!("expected bool, got {value:?}"),
                        });
                    }
                };
            }
            "durability" => {
                let v = value.parse::<u8>().map_err(|_| TypeError::InvalidOpt {
                    opt: "durability",
                    reason: format!("expected small integer, got {value:?}"),
                })?;
                if v > 4 {
                    return Err(TypeError::InvalidOpt {
                        opt: "durability",
                        reason: "durability must be in 0..=4".into(),
                    });
                }
                self.durability = v;
            }
            "data_allowed" => {
                self.data_allowed = parse_data_allowed(value)?;
            }
            _ => {
                return Err(TypeError::NoSuchOpt {
                    opt: name.to_owned(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_unique() {
        for (i, a) in OPT_TABLE.iter().enumerate() {
            for b in &OPT_TABLE[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn defaults_match_table() {
        let opts = Opts::default();
        assert_eq!(opts.metadata_replicas(), 1);
        assert_eq!(opts.data_replicas(), 1);
        assert_eq!(opts.metadata_checksum_type(), ChecksumType::Crc32c);
        assert_eq!(opts.data_checksum_type(), ChecksumType::Crc32c);
        assert_eq!(opts.compression(), CompressionType::None);
        assert_eq!(opts.encryption(), EncryptionType::None);
        assert_eq!(opts.error_action(), ErrorAction::RemountRo);
        assert_eq!(opts.gc_reserve_percent(), 8);
        assert_eq!(opts.btree_node_size(), 256 << 10);
    }

    #[test]
    fn set_by_name_validates() {
        let mut opts = Opts::default();
        opts.set_by_name("compression", "zstd").unwrap();
        assert_eq!(opts.compression(), CompressionType::Zstd);

        assert!(opts.set_by_name("compression", "lzma").is_err());
        assert!(opts.set_by_name("block_size", "1000").is_err());
        assert!(opts.set_by_name("no_such_option", "1").is_err());
        assert!(opts.set_by_name("data_replicas", "9").is_err());

        opts.set_by_name("block_size", "4096").unwrap();
        assert_eq!(opts.block_size, Some(4096));
    }

    #[test]
    fn inode_scoped_options() {
        let names: Vec<_> = inode_opt_names().collect();
        assert!(names.contains(&"compression"));
        assert!(names.contains(&"data_replicas"));
        assert!(!names.contains(&"block_size"));
        assert!(!names.contains(&"encryption"));
    }

    #[test]
    fn dev_opts_parse() {
        let mut d = DevOpts::default();
        d.set_by_name("discard", "true").unwrap();
        d.set_by_name("durability", "2").unwrap();
        d.set_by_name("data_allowed", "cached").unwrap();
        assert!(d.discard);
        assert_eq!(d.durability, 2);
        assert_eq!(d.data_allowed, crate::DataType::Cached.mask_bit());
        assert!(d.set_by_name("durability", "9").is_err());
    }
}
