#![forbid(unsafe_code)]
//! Error types for the workspace.
//!
//! Defines [`Error`] and a [`Result`] alias used throughout. The enum
//! mirrors the error taxonomy of the core: transient errors handled by
//! the transaction layer, degradation, corruption, and fatal classes,
//! plus errno and exit-code mappings for the outward-facing surfaces.

use bch_types::{BtreeId, Pos, TypeError};
use thiserror::Error;

/// Why a transaction attempt must be retried. Never surfaced above the
/// commit wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// A node lock would have been taken out of order.
    LockOrder,
    /// Scratch arena had to be grown; staged state was invalidated.
    MemPressure,
    /// An optimistically read key changed before commit.
    ReadConflict,
    /// Journal has no room; a flush must run first.
    JournalFull,
    /// Node cache could not satisfy an allocation without reclaim.
    CacheReclaim,
}

impl RestartReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LockOrder => "lock_order",
            Self::MemPressure => "mem_pressure",
            Self::ReadConflict => "read_conflict",
            Self::JournalFull => "journal_full",
            Self::CacheReclaim => "cache_reclaim",
        }
    }
}

/// Unified error type for all core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Transient (retryable inside the transaction layer) ──────────
    #[error("transaction restart: {}", reason.as_str())]
    TransactionRestart { reason: RestartReason },

    // ── Superblock validation ───────────────────────────────────────
    #[error("bad magic at superblock offset {offset}")]
    BadMagic { offset: u64 },

    #[error("bad checksum in {what}")]
    BadChecksum { what: &'static str },

    #[error("unknown required feature bits {bits:#x}")]
    UnknownRequiredFeature { bits: u64 },

    #[error("truncated {what}: need {needed} bytes, have {have}")]
    Truncated {
        what: &'static str,
        needed: usize,
        have: usize,
    },

    // ── Corruption ──────────────────────────────────────────────────
    #[error("corrupt metadata in {btree} at {pos}: {detail}")]
    CorruptMetadata {
        btree: BtreeId,
        pos: Pos,
        detail: String,
    },

    #[error("checksum mismatch on device {dev} at sector {sector}")]
    ChecksumMismatch { dev: u32, sector: u64 },

    #[error("consistency check failed: {0}")]
    Fsck(String),

    // ── Degradation and data loss ───────────────────────────────────
    #[error("degraded: {0}")]
    Degraded(String),

    #[error("operation would lose data ({0}); pass force to proceed")]
    DataLossRisk(String),

    #[error("unrecoverable read at {pos}: all replicas failed")]
    UnrecoverableRead { pos: Pos },

    // ── Resources and state ─────────────────────────────────────────
    #[error("no space left on device")]
    NoSpace,

    #[error("filesystem is read-only")]
    ReadOnly,

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("device {0} is not a member of this filesystem")]
    NotAMember(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("filesystem stopped")]
    Stopped,

    #[error(transparent)]
    InvalidType(#[from] TypeError),
}

impl Error {
    #[must_use]
    pub fn restart(reason: RestartReason) -> Self {
        Self::TransactionRestart { reason }
    }

    /// Transient errors the transaction wrapper retries transparently.
    #[must_use]
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::TransactionRestart { .. })
    }

    /// Corruption-class errors: handled by fsck under repair policy,
    /// fatal to the operation otherwise.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptMetadata { .. }
                | Self::ChecksumMismatch { .. }
                | Self::Fsck(_)
                | Self::BadChecksum { .. }
        )
    }

    /// Convert into a POSIX errno for the adapter surfaces.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::TransactionRestart { .. } => libc::EAGAIN,
            Self::BadMagic { .. }
            | Self::BadChecksum { .. }
            | Self::Truncated { .. }
            | Self::CorruptMetadata { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Fsck(_)
            | Self::UnrecoverableRead { .. } => libc::EIO,
            Self::UnknownRequiredFeature { .. } => libc::EPROTONOSUPPORT,
            Self::Degraded(_) | Self::DataLossRisk(_) => libc::EIO,
            Self::NoSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
            Self::Cancelled => libc::ECANCELED,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::NotAMember(_) | Self::InvalidArgument(_) | Self::InvalidType(_) => libc::EINVAL,
            Self::NotImplemented(_) => libc::EOPNOTSUPP,
            Self::Stopped => libc::ESHUTDOWN,
        }
    }
}

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

// ── CLI exit codes ──────────────────────────────────────────────────────────

/// Process exit codes of the command-line surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    /// Usage error or generic failure.
    Error = 1,
    /// Corruption was detected and fixed.
    FixedErrors = 2,
    /// Uncorrectable corruption remains.
    UncorrectedErrors = 4,
    Fatal = 8,
    HelpDisplayed = 16,
}

impl ExitCode {
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_is_transient_only() {
        let e = Error::restart(RestartReason::LockOrder);
        assert!(e.is_restart());
        assert!(!e.is_corruption());
        assert!(!Error::NoSpace.is_restart());
    }

    #[test]
    fn corruption_classification() {
        assert!(
            Error::ChecksumMismatch {
                dev: 0,
                sector: 1024
            }
            .is_corruption()
        );
        assert!(Error::Fsck("bad key order".into()).is_corruption());
        assert!(!Error::ReadOnly.is_corruption());
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(Error::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(Error::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(
            Error::restart(RestartReason::ReadConflict).to_errno(),
            libc::EAGAIN
        );
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::Error.code(), 1);
        assert_eq!(ExitCode::FixedErrors.code(), 2);
        assert_eq!(ExitCode::UncorrectedErrors.code(), 4);
        assert_eq!(ExitCode::Fatal.code(), 8);
        assert_eq!(ExitCode::HelpDisplayed.code(), 16);
    }
}
