#![forbid(unsafe_code)]
//! Shared types and constants for SnapDiff.
//!
//! Defines the per-path status bitmask, the btrfs send-stream wire
//! constants, the kernel ABI constants the ioctl layer depends on, and
//! the little-endian slice readers used by every parser in the
//! workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ── Send-stream wire constants ──────────────────────────────────────────────

/// Magic prefix of a btrfs send stream, including the trailing NUL.
pub const SEND_STREAM_MAGIC: &[u8; 13] = b"btrfs-stream\0";
/// Stream format version this crate understands.
pub const SEND_STREAM_VERSION: u32 = 1;
/// Command header: len (u32) + cmd (u16) + crc32c (u32).
pub const SEND_CMD_HEADER_SIZE: usize = 10;
/// TLV header: type (u16) + len (u16).
pub const SEND_TLV_HEADER_SIZE: usize = 4;

/// Send-stream command codes (`BTRFS_SEND_C_*`).
pub const SEND_C_UNSPEC: u16 = 0;
pub const SEND_C_SUBVOL: u16 = 1;
pub const SEND_C_SNAPSHOT: u16 = 2;
pub const SEND_C_MKFILE: u16 = 3;
pub const SEND_C_MKDIR: u16 = 4;
pub const SEND_C_MKNOD: u16 = 5;
pub const SEND_C_MKFIFO: u16 = 6;
pub const SEND_C_MKSOCK: u16 = 7;
pub const SEND_C_SYMLINK: u16 = 8;
pub const SEND_C_RENAME: u16 = 9;
pub const SEND_C_LINK: u16 = 10;
pub const SEND_C_UNLINK: u16 = 11;
pub const SEND_C_RMDIR: u16 = 12;
pub const SEND_C_SET_XATTR: u16 = 13;
pub const SEND_C_REMOVE_XATTR: u16 = 14;
pub const SEND_C_WRITE: u16 = 15;
pub const SEND_C_CLONE: u16 = 16;
pub const SEND_C_TRUNCATE: u16 = 17;
pub const SEND_C_CHMOD: u16 = 18;
pub const SEND_C_CHOWN: u16 = 19;
pub const SEND_C_UTIMES: u16 = 20;
pub const SEND_C_END: u16 = 21;
pub const SEND_C_UPDATE_EXTENT: u16 = 22;

/// Send-stream attribute (TLV) codes (`BTRFS_SEND_A_*`).
pub const SEND_A_UNSPEC: u16 = 0;
pub const SEND_A_UUID: u16 = 1;
pub const SEND_A_CTRANSID: u16 = 2;
pub const SEND_A_INO: u16 = 3;
pub const SEND_A_SIZE: u16 = 4;
pub const SEND_A_MODE: u16 = 5;
pub const SEND_A_UID: u16 = 6;
pub const SEND_A_GID: u16 = 7;
pub const SEND_A_RDEV: u16 = 8;
pub const SEND_A_CTIME: u16 = 9;
pub const SEND_A_MTIME: u16 = 10;
pub const SEND_A_ATIME: u16 = 11;
pub const SEND_A_OTIME: u16 = 12;
pub const SEND_A_XATTR_NAME: u16 = 13;
pub const SEND_A_XATTR_DATA: u16 = 14;
pub const SEND_A_PATH: u16 = 15;
pub const SEND_A_PATH_TO: u16 = 16;
pub const SEND_A_PATH_LINK: u16 = 17;
pub const SEND_A_FILE_OFFSET: u16 = 18;
pub const SEND_A_DATA: u16 = 19;
pub const SEND_A_CLONE_UUID: u16 = 20;
pub const SEND_A_CLONE_CTRANSID: u16 = 21;
pub const SEND_A_CLONE_PATH: u16 = 22;
pub const SEND_A_CLONE_OFFSET: u16 = 23;
pub const SEND_A_CLONE_LEN: u16 = 24;

// ── Kernel ABI constants ────────────────────────────────────────────────────

/// ioctl magic shared by all btrfs ioctls.
pub const BTRFS_IOCTL_MAGIC: u8 = 0x94;
/// `BTRFS_SUBVOL_GETFLAGS` read-only bit.
pub const BTRFS_SUBVOL_RDONLY: u64 = 1 << 1;
/// Suppress file-data payloads in the send stream; metadata only.
pub const BTRFS_SEND_FLAG_NO_FILE_DATA: u64 = 0x1;

/// Objectid of the root tree itself.
pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
/// First objectid available for user subvolumes; also the inode number
/// of every subvolume root directory.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
/// Last objectid available for user subvolumes.
pub const BTRFS_LAST_FREE_OBJECTID: u64 = u64::MAX - 256;

/// Root-tree item types consumed by the subvolume resolver.
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
pub const BTRFS_ROOT_BACKREF_KEY: u8 = 144;

/// Byte offset of the subvolume UUID within a `btrfs_root_item`.
pub const ROOT_ITEM_UUID_OFFSET: usize = 247;
/// Byte offset of `ctransid` within a `btrfs_root_item`.
pub const ROOT_ITEM_CTRANSID_OFFSET: usize = 295;

// ── Status bitmask ──────────────────────────────────────────────────────────

/// Per-path change status: a set over the eight change-class flags.
///
/// `CREATED` and `DELETED` are mutually exclusive after normalization;
/// the attribute flags (`CONTENT` through `ACL`) only matter when
/// neither is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Status(pub u32);

impl Status {
    pub const EMPTY: Self = Self(0);
    pub const CREATED: Self = Self(1 << 0);
    pub const DELETED: Self = Self(1 << 1);
    pub const CONTENT: Self = Self(1 << 2);
    pub const PERMISSIONS: Self = Self(1 << 3);
    pub const OWNER: Self = Self(1 << 4);
    pub const GROUP: Self = Self(1 << 5);
    pub const XATTRS: Self = Self(1 << 6);
    pub const ACL: Self = Self(1 << 7);

    /// All six attribute flags; everything except `CREATED`/`DELETED`.
    pub const ATTRIBUTES: Self = Self(
        Self::CONTENT.0
            | Self::PERMISSIONS.0
            | Self::OWNER.0
            | Self::GROUP.0
            | Self::XATTRS.0
            | Self::ACL.0,
    );

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Remove `other`'s flags from `self`.
    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Render the report column used by the CLI: one position per flag,
    /// `.` for unset. Created and deleted share the first column.
    #[must_use]
    pub fn to_letters(self) -> String {
        let mut s = String::with_capacity(7);
        s.push(if self.contains(Self::CREATED) {
            '+'
        } else if self.contains(Self::DELETED) {
            '-'
        } else {
            '.'
        });
        for (flag, letter) in [
            (Self::CONTENT, 'c'),
            (Self::PERMISSIONS, 'p'),
            (Self::OWNER, 'u'),
            (Self::GROUP, 'g'),
            (Self::XATTRS, 'x'),
            (Self::ACL, 'a'),
        ] {
            s.push(if self.contains(flag) { letter } else { '.' });
        }
        s
    }
}

impl std::ops::BitOr for Status {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for Status {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_letters())
    }
}

// ── Public record types ─────────────────────────────────────────────────────

/// One subvolume known to the resolver index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeRecord {
    /// Path relative to the base subvolume, no leading `/`.
    pub path: PathBuf,
    /// Root tree objectid; opaque input to the send ioctl.
    pub root_id: u64,
    pub uuid: [u8; 16],
    /// Transaction id of the last change under this root.
    pub ctransid: u64,
}

/// One materialized diff report line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Absolute path within the snapshot, leading `/`.
    pub path: PathBuf,
    pub status: Status,
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic { expected: Vec<u8>, actual: Vec<u8> },
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("invalid path encoding in stream")]
    InvalidPath,
}

// ── Little-endian slice readers ─────────────────────────────────────────────

fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "overflow",
    })?;
    data.get(offset..end).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: data.len().saturating_sub(offset),
    })
}

pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    let mut out = [0_u8; 8];
    out.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(out))
}

pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ── CRC32C (Castagnoli) ─────────────────────────────────────────────────────

const fn crc32c_table() -> [u32; 256] {
    let poly: u32 = 0x82F6_3B78;
    let mut table = [0_u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ poly } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = crc32c_table();

/// CRC32C over `data`, as used by the send-stream command checksum.
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0_u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32C_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
