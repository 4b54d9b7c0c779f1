//! btrfs ioctl wrappers.
//!
//! Request numbers and struct layouts match the kernel ABI verbatim;
//! the size assertions in the test module pin them. All wrappers take
//! borrowed descriptors and surface plain `io::Error`s.

use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};
use sdf_types::{
    BTRFS_IOCTL_MAGIC, BTRFS_SEND_FLAG_NO_FILE_DATA, BTRFS_SUBVOL_RDONLY, read_fixed,
};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

/// `struct btrfs_ioctl_send_args`.
#[repr(C)]
struct SendArgs {
    send_fd: i64,
    clone_sources_count: u64,
    clone_sources: *const u64,
    parent_root: u64,
    flags: u64,
    version: u32,
    reserved: [u8; 28],
}

/// `struct btrfs_ioctl_search_key`.
#[repr(C)]
#[derive(Clone, Copy)]
struct SearchKey {
    tree_id: u64,
    min_objectid: u64,
    max_objectid: u64,
    min_offset: u64,
    max_offset: u64,
    min_transid: u64,
    max_transid: u64,
    min_type: u32,
    max_type: u32,
    nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

const SEARCH_BUF_SIZE: usize = 4096 - std::mem::size_of::<SearchKey>();
/// Result record header inside the search buffer:
/// `{ transid, objectid, offset: u64, type, len: u32 }`.
const SEARCH_HEADER_SIZE: usize = 32;

/// `struct btrfs_ioctl_search_args`.
#[repr(C)]
struct TreeSearchArgs {
    key: SearchKey,
    buf: [u8; SEARCH_BUF_SIZE],
}

const INO_LOOKUP_PATH_MAX: usize = 4080;

/// `struct btrfs_ioctl_ino_lookup_args`.
#[repr(C)]
struct InoLookupArgs {
    treeid: u64,
    objectid: u64,
    name: [u8; INO_LOOKUP_PATH_MAX],
}

ioctl_read!(btrfs_subvol_getflags, BTRFS_IOCTL_MAGIC, 25, u64);
ioctl_write_ptr!(btrfs_send, BTRFS_IOCTL_MAGIC, 38, SendArgs);
ioctl_readwrite!(btrfs_tree_search, BTRFS_IOCTL_MAGIC, 17, TreeSearchArgs);
ioctl_readwrite!(btrfs_ino_lookup, BTRFS_IOCTL_MAGIC, 18, InoLookupArgs);

/// Query the subvolume flag word of an open subvolume directory.
pub fn subvolume_flags(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let mut flags: u64 = 0;
    unsafe { btrfs_subvol_getflags(fd.as_raw_fd(), &mut flags) }.map_err(io::Error::from)?;
    Ok(flags)
}

/// Whether the subvolume behind `fd` carries the read-only flag.
pub fn is_subvolume_read_only(fd: BorrowedFd<'_>) -> io::Result<bool> {
    Ok(subvolume_flags(fd)? & BTRFS_SUBVOL_RDONLY != 0)
}

/// Issue the blocking send ioctl: describe the subvolume behind
/// `snapshot` relative to `parent_root`, writing the stream into
/// `stream_out`. File data payloads are suppressed; the diff only
/// needs to know *that* an extent changed.
pub fn send_subvolume(
    snapshot: BorrowedFd<'_>,
    stream_out: BorrowedFd<'_>,
    parent_root: u64,
    clone_sources: &[u64],
) -> io::Result<()> {
    let args = SendArgs {
        send_fd: i64::from(stream_out.as_raw_fd()),
        clone_sources_count: clone_sources.len() as u64,
        clone_sources: clone_sources.as_ptr(),
        parent_root,
        flags: BTRFS_SEND_FLAG_NO_FILE_DATA,
        version: 0,
        reserved: [0; 28],
    };
    unsafe { btrfs_send(snapshot.as_raw_fd(), &args) }.map_err(io::Error::from)?;
    Ok(())
}

/// Create the anonymous pipe the send stream flows through. Both ends
/// carry `O_CLOEXEC`.
pub fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(io::Error::from)
}

/// One leaf item returned by the tree-search ioctl.
#[derive(Debug, Clone)]
pub(crate) struct SearchItem {
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub data: Vec<u8>,
}

/// Enumerate all items of `[min_type, max_type]` for objectids in
/// `[min_objectid, max_objectid]` within `tree_id`, restarting the
/// search past the last returned key until the range is exhausted.
pub(crate) fn search_tree(
    fd: BorrowedFd<'_>,
    tree_id: u64,
    min_objectid: u64,
    max_objectid: u64,
    min_type: u32,
    max_type: u32,
) -> io::Result<Vec<SearchItem>> {
    let mut items = Vec::new();
    let mut next = (min_objectid, min_type, 0_u64);

    loop {
        let mut args = TreeSearchArgs {
            key: SearchKey {
                tree_id,
                min_objectid: next.0,
                max_objectid,
                min_offset: next.2,
                max_offset: u64::MAX,
                min_transid: 0,
                max_transid: u64::MAX,
                min_type: next.1,
                max_type,
                nr_items: 4096,
                unused: 0,
                unused1: 0,
                unused2: 0,
                unused3: 0,
                unused4: 0,
            },
            buf: [0; SEARCH_BUF_SIZE],
        };
        unsafe { btrfs_tree_search(fd.as_raw_fd(), &mut args) }.map_err(io::Error::from)?;
        if args.key.nr_items == 0 {
            break;
        }

        let mut cursor = 0_usize;
        let mut last = None;
        for _ in 0..args.key.nr_items {
            let (item, consumed) = parse_search_record(&args.buf, cursor)?;
            cursor += consumed;
            last = Some((item.objectid, item.item_type, item.offset));
            items.push(item);
        }

        let Some((objectid, item_type, offset)) = last else {
            break;
        };
        let Some(advanced) = advance_search_position(objectid, item_type, offset) else {
            break;
        };
        next = advanced;
        if next.0 > max_objectid {
            break;
        }
    }

    Ok(items)
}

fn parse_search_record(buf: &[u8], offset: usize) -> io::Result<(SearchItem, usize)> {
    let objectid = ne_u64(buf, offset + 8)?;
    let item_offset = ne_u64(buf, offset + 16)?;
    let item_type = ne_u32(buf, offset + 24)?;
    let len = ne_u32(buf, offset + 28)? as usize;

    let data = buf
        .get(offset + SEARCH_HEADER_SIZE..offset + SEARCH_HEADER_SIZE + len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "search item truncated"))?
        .to_vec();

    Ok((
        SearchItem {
            objectid,
            offset: item_offset,
            item_type,
            data,
        },
        SEARCH_HEADER_SIZE + len,
    ))
}

/// Next (objectid, type, offset) triple strictly after the given key,
/// or `None` when the key space is exhausted.
fn advance_search_position(objectid: u64, item_type: u32, offset: u64) -> Option<(u64, u32, u64)> {
    if offset < u64::MAX {
        Some((objectid, item_type, offset + 1))
    } else if item_type < 255 {
        Some((objectid, item_type + 1, 0))
    } else if objectid < u64::MAX {
        Some((objectid + 1, 0, 0))
    } else {
        None
    }
}

/// Resolve the path of inode `objectid` within `treeid` (0 = the tree
/// of `fd` itself). Returns the resolved tree id and the path, which
/// the kernel terminates with a trailing `/` (empty for the tree root).
pub(crate) fn ino_lookup(
    fd: BorrowedFd<'_>,
    treeid: u64,
    objectid: u64,
) -> io::Result<(u64, String)> {
    let mut args = InoLookupArgs {
        treeid,
        objectid,
        name: [0; INO_LOOKUP_PATH_MAX],
    };
    unsafe { btrfs_ino_lookup(fd.as_raw_fd(), &mut args) }.map_err(io::Error::from)?;
    let nul = args
        .name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(INO_LOOKUP_PATH_MAX);
    let path = std::str::from_utf8(&args.name[..nul])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 subvolume path"))?
        .to_owned();
    Ok((args.treeid, path))
}

fn ne_u64(buf: &[u8], offset: usize) -> io::Result<u64> {
    read_fixed::<8>(buf, offset)
        .map(u64::from_ne_bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "search buffer truncated"))
}

fn ne_u32(buf: &[u8], offset: usize) -> io::Result<u32> {
    read_fixed::<4>(buf, offset)
        .map(u32::from_ne_bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "search buffer truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_struct_sizes_are_pinned() {
        assert_eq!(std::mem::size_of::<SendArgs>(), 72);
        assert_eq!(std::mem::size_of::<SearchKey>(), 104);
        assert_eq!(std::mem::size_of::<TreeSearchArgs>(), 4096);
        assert_eq!(std::mem::size_of::<InoLookupArgs>(), 4096);
    }

    #[test]
    fn search_position_advances_with_carry() {
        assert_eq!(advance_search_position(5, 132, 7), Some((5, 132, 8)));
        assert_eq!(
            advance_search_position(5, 132, u64::MAX),
            Some((5, 133, 0))
        );
        assert_eq!(
            advance_search_position(5, 255, u64::MAX),
            Some((6, 0, 0))
        );
        assert_eq!(advance_search_position(u64::MAX, 255, u64::MAX), None);
    }

    #[test]
    fn search_record_parses_header_and_payload() {
        let mut buf = vec![0_u8; 64];
        buf[0..8].copy_from_slice(&9_u64.to_ne_bytes()); // transid
        buf[8..16].copy_from_slice(&256_u64.to_ne_bytes()); // objectid
        buf[16..24].copy_from_slice(&5_u64.to_ne_bytes()); // offset
        buf[24..28].copy_from_slice(&132_u32.to_ne_bytes()); // type
        buf[28..32].copy_from_slice(&3_u32.to_ne_bytes()); // len
        buf[32..35].copy_from_slice(b"abc");

        let (item, consumed) = parse_search_record(&buf, 0).expect("parse");
        assert_eq!(consumed, 35);
        assert_eq!(item.objectid, 256);
        assert_eq!(item.offset, 5);
        assert_eq!(item.item_type, 132);
        assert_eq!(item.data, b"abc");
    }

    #[test]
    fn truncated_search_record_is_rejected() {
        let buf = vec![0_u8; 16];
        assert!(parse_search_record(&buf, 0).is_err());
    }

    #[test]
    fn pipe_ends_are_distinct_descriptors() {
        let (read_end, write_end) = create_pipe().expect("pipe");
        assert_ne!(read_end.as_raw_fd(), write_end.as_raw_fd());
    }
}
