//! Directory handles.
//!
//! A [`SnapshotDir`] owns an `O_DIRECTORY` file descriptor plus the
//! absolute path it was opened from. Traversal below a handle is done
//! segment by segment with `O_NOFOLLOW`, so a symlink planted inside a
//! snapshot can never redirect a comparison outside it.

use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{fstatat, FileStat, Mode};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use sdf_types::BTRFS_FIRST_FREE_OBJECTID;

/// An open directory inside (or at the root of) a snapshot.
#[derive(Debug)]
pub struct SnapshotDir {
    fd: OwnedFd,
    path: PathBuf,
}

impl SnapshotDir {
    /// Open a directory by absolute or cwd-relative path. The
    /// descriptor carries `O_CLOEXEC` (std default) and `O_DIRECTORY`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(&path)?;
        Ok(Self {
            fd: file.into(),
            path,
        })
    }

    #[must_use]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of this directory relative to `base`, if it lies beneath it.
    #[must_use]
    pub fn relative_to(&self, base: &SnapshotDir) -> Option<PathBuf> {
        self.path
            .strip_prefix(&base.path)
            .ok()
            .map(Path::to_path_buf)
    }

    /// Open a direct child directory without following symlinks.
    pub fn open_subdir(&self, name: &str) -> io::Result<SnapshotDir> {
        let fd = nix::fcntl::openat(
            Some(self.fd.as_raw_fd()),
            name,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(io::Error::from)?;
        Ok(SnapshotDir {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            path: self.path.join(name),
        })
    }

    /// Walk a `/`-separated relative path one segment at a time, never
    /// crossing a symlink. An empty path reopens this directory.
    pub fn open_segments(&self, rel: &str) -> io::Result<SnapshotDir> {
        let mut current = self.try_clone()?;
        for segment in rel.split('/').filter(|s| !s.is_empty()) {
            current = current.open_subdir(segment)?;
        }
        Ok(current)
    }

    fn try_clone(&self) -> io::Result<SnapshotDir> {
        Ok(SnapshotDir {
            fd: self.fd.try_clone()?,
            path: self.path.clone(),
        })
    }

    /// `fstatat` of a direct child, `AT_SYMLINK_NOFOLLOW`.
    pub fn stat_entry(&self, name: &str) -> io::Result<FileStat> {
        fstatat(Some(self.fd.as_raw_fd()), name, AtFlags::AT_SYMLINK_NOFOLLOW).map_err(io::Error::from)
    }

    /// Open a direct child for reading, refusing symlinks.
    pub fn open_entry(&self, name: &str) -> io::Result<File> {
        let fd = nix::fcntl::openat(
            Some(self.fd.as_raw_fd()),
            name,
            OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(io::Error::from)?;
        Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    /// Symlink target of a direct child.
    pub fn read_link(&self, name: &str) -> io::Result<std::ffi::OsString> {
        nix::fcntl::readlinkat(Some(self.fd.as_raw_fd()), name).map_err(io::Error::from)
    }

    /// Every entry beneath this directory, as `/`-joined relative
    /// paths in sorted order, directories before their contents.
    /// Symlinks are listed but never followed; subdirectories are
    /// re-entered through this handle's descriptor, never by path.
    pub fn entries_recursive(&self) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        collect_entries(self, "", &mut out)?;
        Ok(out)
    }

    /// Whether this directory is the root of a btrfs subvolume. A
    /// subvolume root always has inode 256.
    pub fn is_subvolume(&self) -> io::Result<bool> {
        let stat = nix::sys::stat::fstat(self.fd.as_raw_fd()).map_err(io::Error::from)?;
        Ok(stat.st_ino == BTRFS_FIRST_FREE_OBJECTID)
    }

    /// Raw descriptor number, used to build `/proc/self/fd` paths.
    #[must_use]
    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }
}

fn collect_entries(dir: &SnapshotDir, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
    // Enumerate through the open descriptor, not the stored path; the
    // /proc link pins the fd's identity, so a swapped-out directory
    // cannot redirect the walk.
    let mut names: Vec<(String, bool)> = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/self/fd/{}", dir.raw_fd()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type()?.is_dir();
        names.push((name, is_dir));
    }
    names.sort();
    for (name, is_dir) in names {
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        out.push(rel.clone());
        if is_dir {
            // O_NOFOLLOW through the parent fd; a directory swapped
            // for a symlink after the listing fails here instead of
            // escaping the snapshot.
            let child = dir.open_subdir(&name)?;
            collect_entries(&child, &rel, out)?;
        }
    }
    Ok(())
}
