//! Per-file content compare.
//!
//! The send stream reports the *intent* of writes but coarsens
//! overlapping intents: a chmod immediately reverted or a write that
//! restored identical bytes still shows up as touched. This module
//! re-measures a single touched path against both snapshot roots and
//! returns only the attribute classes that actually differ, at
//! O(touched files) instead of O(all files).

use crate::aggregator::split_path;
use nix::sys::stat::{FileStat, SFlag};
use sdf_kernel::SnapshotDir;
use sdf_types::Status;
use std::fs::File;
use std::io::{self, Read};
use tracing::warn;

/// POSIX ACLs live in this xattr pair.
pub const ACL_ACCESS_XATTR: &[u8] = b"system.posix_acl_access";
pub const ACL_DEFAULT_XATTR: &[u8] = b"system.posix_acl_default";

/// Whether an xattr name denotes a POSIX ACL.
#[must_use]
pub fn is_acl_signature(name: &[u8]) -> bool {
    name == ACL_ACCESS_XATTR || name == ACL_DEFAULT_XATTR
}

/// Measure which attribute classes differ for `path` between the two
/// snapshot roots. A stat or open failure means the entry cannot be
/// trusted on at least one side, so every class is reported changed.
pub fn compare_entry(dir1: &SnapshotDir, dir2: &SnapshotDir, path: &str) -> Status {
    match try_compare(dir1, dir2, path) {
        Ok(status) => status,
        Err(err) => {
            warn!(path, %err, "content compare failed, reporting fully changed");
            Status::ATTRIBUTES
        }
    }
}

fn try_compare(dir1: &SnapshotDir, dir2: &SnapshotDir, path: &str) -> io::Result<Status> {
    let (dirname, basename) = split_path(path);
    let parent1 = dir1.open_segments(dirname)?;
    let parent2 = dir2.open_segments(dirname)?;
    let stat1 = parent1.stat_entry(basename)?;
    let stat2 = parent2.stat_entry(basename)?;

    let mut status = Status::EMPTY;
    if content_differs(&parent1, &parent2, basename, &stat1, &stat2)? {
        status |= Status::CONTENT;
    }
    if stat1.st_mode & 0o7777 != stat2.st_mode & 0o7777 {
        status |= Status::PERMISSIONS;
    }
    if stat1.st_uid != stat2.st_uid {
        status |= Status::OWNER;
    }
    if stat1.st_gid != stat2.st_gid {
        status |= Status::GROUP;
    }

    #[cfg(feature = "xattr")]
    {
        let xattrs1 = sdf_kernel::entry_xattrs(&parent1, basename)?;
        let xattrs2 = sdf_kernel::entry_xattrs(&parent2, basename)?;
        if xattrs1 != xattrs2 {
            status |= Status::XATTRS;
        }
        if xattrs1.get(ACL_ACCESS_XATTR) != xattrs2.get(ACL_ACCESS_XATTR)
            || xattrs1.get(ACL_DEFAULT_XATTR) != xattrs2.get(ACL_DEFAULT_XATTR)
        {
            status |= Status::ACL;
        }
    }

    Ok(status)
}

fn file_type(stat: &FileStat) -> u32 {
    stat.st_mode & SFlag::S_IFMT.bits()
}

fn content_differs(
    parent1: &SnapshotDir,
    parent2: &SnapshotDir,
    name: &str,
    stat1: &FileStat,
    stat2: &FileStat,
) -> io::Result<bool> {
    if file_type(stat1) != file_type(stat2) {
        return Ok(true);
    }
    if file_type(stat1) == SFlag::S_IFREG.bits() {
        if stat1.st_size != stat2.st_size {
            return Ok(true);
        }
        return files_differ(parent1.open_entry(name)?, parent2.open_entry(name)?);
    }
    if file_type(stat1) == SFlag::S_IFLNK.bits() {
        return Ok(parent1.read_link(name)? != parent2.read_link(name)?);
    }
    // Directories and special files have no content of their own.
    Ok(false)
}

fn files_differ(mut a: File, mut b: File) -> io::Result<bool> {
    let mut buf_a = [0_u8; 8192];
    let mut buf_b = [0_u8; 8192];
    loop {
        let got_a = read_full(&mut a, &mut buf_a)?;
        let got_b = read_full(&mut b, &mut buf_b)?;
        if got_a != got_b || buf_a[..got_a] != buf_b[..got_b] {
            return Ok(true);
        }
        if got_a == 0 {
            return Ok(false);
        }
    }
}

/// Fill `buf` as far as the reader allows; short only at EOF.
fn read_full(reader: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
