//! Kernel interface for SnapDiff.
//!
//! Everything that talks to Linux lives here: directory file
//! descriptors with symlink-free traversal, the btrfs ioctls (subvolume
//! flags, send, tree search, inode lookup), pipe creation, and the
//! subvolume resolver built on top of the tree-search ioctl.
//!
//! This is the only crate in the workspace that contains `unsafe`
//! (ioctl and xattr syscalls); every other crate forbids it.

mod dir;
mod ioctl;
mod subvol;
#[cfg(feature = "xattr")]
mod xattr;

pub use dir::SnapshotDir;
pub use ioctl::{create_pipe, is_subvolume_read_only, send_subvolume, subvolume_flags};
pub use subvol::SubvolumeIndex;
#[cfg(feature = "xattr")]
pub use xattr::entry_xattrs;
