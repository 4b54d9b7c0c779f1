//! Subvolume resolver.
//!
//! Builds an index of every subvolume reachable beneath a base
//! directory by scanning the root tree (`ROOT_ITEM` + `ROOT_BACKREF`
//! items) and assembling each subvolume's path from its backref chain,
//! resolving directory components with the ino-lookup ioctl.

use crate::dir::SnapshotDir;
use crate::ioctl::{self, SearchItem};
use sdf_types::{
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_LAST_FREE_OBJECTID, BTRFS_ROOT_BACKREF_KEY,
    BTRFS_ROOT_ITEM_KEY, BTRFS_ROOT_TREE_OBJECTID, ROOT_ITEM_CTRANSID_OFFSET,
    ROOT_ITEM_UUID_OFFSET, SubvolumeRecord, read_fixed, read_le_u16, read_le_u64,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One `ROOT_BACKREF` edge: the subvolume lives under directory
/// `dirid` of subvolume `parent`, under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BackRef {
    parent: u64,
    dirid: u64,
    name: String,
}

/// Path index over the subvolumes beneath one base directory.
#[derive(Debug)]
pub struct SubvolumeIndex {
    records: Vec<SubvolumeRecord>,
}

impl SubvolumeIndex {
    /// Enumerate the filesystem's subvolumes and keep those whose
    /// backref chain reaches the base subvolume. Requires the
    /// privileges the tree-search ioctl demands.
    pub fn new(base: &SnapshotDir) -> io::Result<Self> {
        let (base_root, _) = ioctl::ino_lookup(base.fd(), 0, BTRFS_FIRST_FREE_OBJECTID)?;
        let items = ioctl::search_tree(
            base.fd(),
            BTRFS_ROOT_TREE_OBJECTID,
            BTRFS_FIRST_FREE_OBJECTID,
            BTRFS_LAST_FREE_OBJECTID,
            u32::from(BTRFS_ROOT_ITEM_KEY),
            u32::from(BTRFS_ROOT_BACKREF_KEY),
        )?;

        let (roots, backrefs) = split_root_items(&items);
        let records = assemble_records(base_root, &roots, &backrefs, |tree, dirid| {
            Ok(ioctl::ino_lookup(base.fd(), tree, dirid)?.1)
        })?;
        debug!(
            base_root,
            subvolumes = records.len(),
            "subvolume_index_initialized"
        );
        Ok(Self { records })
    }

    /// Root id of the subvolume at `relative_path` beneath the base,
    /// or `None` when no subvolume maps to that path.
    #[must_use]
    pub fn root_id_of(&self, relative_path: &Path) -> Option<u64> {
        self.records
            .iter()
            .find(|r| r.path == relative_path)
            .map(|r| r.root_id)
    }

    #[must_use]
    pub fn records(&self) -> &[SubvolumeRecord] {
        &self.records
    }
}

/// Split raw root-tree items into `(root_id, uuid, ctransid)` triples
/// and backref edges keyed by child root id.
fn split_root_items(items: &[SearchItem]) -> (Vec<(u64, [u8; 16], u64)>, HashMap<u64, BackRef>) {
    let mut roots = Vec::new();
    let mut backrefs = HashMap::new();

    for item in items {
        if item.item_type == u32::from(BTRFS_ROOT_ITEM_KEY) {
            // Pre-v2 root items lack the uuid/ctransid tail; report zeros.
            let uuid = read_fixed::<16>(&item.data, ROOT_ITEM_UUID_OFFSET).unwrap_or([0; 16]);
            let ctransid = read_le_u64(&item.data, ROOT_ITEM_CTRANSID_OFFSET).unwrap_or(0);
            roots.push((item.objectid, uuid, ctransid));
        } else if item.item_type == u32::from(BTRFS_ROOT_BACKREF_KEY) {
            match parse_backref(&item.data) {
                Some((dirid, name)) => {
                    backrefs.insert(
                        item.objectid,
                        BackRef {
                            parent: item.offset,
                            dirid,
                            name,
                        },
                    );
                }
                None => {
                    warn!(root_id = item.objectid, "malformed root backref skipped");
                }
            }
        }
    }

    (roots, backrefs)
}

/// `struct btrfs_root_ref`: `{ dirid: u64, sequence: u64, name_len: u16 }`
/// followed by the name.
fn parse_backref(data: &[u8]) -> Option<(u64, String)> {
    let dirid = read_le_u64(data, 0).ok()?;
    let name_len = usize::from(read_le_u16(data, 16).ok()?);
    let name = data.get(18..18 + name_len)?;
    Some((dirid, String::from_utf8(name.to_vec()).ok()?))
}

/// Turn root items + backref edges into records with paths relative to
/// `base_root`. Subvolumes whose ancestry does not reach the base are
/// dropped; the base itself is not listed.
fn assemble_records<L>(
    base_root: u64,
    roots: &[(u64, [u8; 16], u64)],
    backrefs: &HashMap<u64, BackRef>,
    mut lookup_dir: L,
) -> io::Result<Vec<SubvolumeRecord>>
where
    L: FnMut(u64, u64) -> io::Result<String>,
{
    let mut paths: HashMap<u64, Option<String>> = HashMap::new();
    let mut records = Vec::new();

    for &(root_id, uuid, ctransid) in roots {
        if root_id == base_root {
            continue;
        }
        let path = path_of(root_id, base_root, backrefs, &mut lookup_dir, &mut paths, 0)?;
        if let Some(path) = path {
            records.push(SubvolumeRecord {
                path: PathBuf::from(path),
                root_id,
                uuid,
                ctransid,
            });
        }
    }

    Ok(records)
}

/// Subvolume nesting deeper than this means a cyclic or corrupt
/// backref chain; such roots are treated as unreachable.
const MAX_SUBVOL_DEPTH: usize = 128;

fn path_of<L>(
    root_id: u64,
    base_root: u64,
    backrefs: &HashMap<u64, BackRef>,
    lookup_dir: &mut L,
    memo: &mut HashMap<u64, Option<String>>,
    depth: usize,
) -> io::Result<Option<String>>
where
    L: FnMut(u64, u64) -> io::Result<String>,
{
    if root_id == base_root {
        return Ok(Some(String::new()));
    }
    if depth > MAX_SUBVOL_DEPTH {
        warn!(root_id, "backref chain too deep, skipping subvolume");
        return Ok(None);
    }
    if let Some(cached) = memo.get(&root_id) {
        return Ok(cached.clone());
    }
    let Some(backref) = backrefs.get(&root_id) else {
        memo.insert(root_id, None);
        return Ok(None);
    };

    let Some(parent_path) =
        path_of(backref.parent, base_root, backrefs, lookup_dir, memo, depth + 1)?
    else {
        memo.insert(root_id, None);
        return Ok(None);
    };

    // The kernel returns the containing directory's path with a
    // trailing slash, or the empty string when dirid is the tree root.
    let dir_prefix = if backref.dirid == BTRFS_FIRST_FREE_OBJECTID {
        String::new()
    } else {
        lookup_dir(backref.parent, backref.dirid)?
    };

    let mut path = parent_path;
    if !path.is_empty() {
        path.push('/');
    }
    path.push_str(&dir_prefix);
    path.push_str(&backref.name);

    memo.insert(root_id, Some(path.clone()));
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backref(parent: u64, dirid: u64, name: &str) -> BackRef {
        BackRef {
            parent,
            dirid,
            name: name.to_owned(),
        }
    }

    #[test]
    fn backref_payload_roundtrip() {
        let mut data = Vec::new();
        data.extend_from_slice(&300_u64.to_le_bytes()); // dirid
        data.extend_from_slice(&1_u64.to_le_bytes()); // sequence
        data.extend_from_slice(&8_u16.to_le_bytes()); // name_len
        data.extend_from_slice(b"snapshot");
        assert_eq!(parse_backref(&data), Some((300, "snapshot".to_owned())));
        assert_eq!(parse_backref(&data[..10]), None);
    }

    #[test]
    fn assembles_paths_relative_to_base() {
        // base (5) ─ .snapshots dir (dirid 300) ─ subvol 257 "snapshot"
        //          └ subvol 258 "other" directly in the base root
        let roots = vec![(257, [1; 16], 10), (258, [2; 16], 11)];
        let mut backrefs = HashMap::new();
        backrefs.insert(257, backref(5, 300, "snapshot"));
        backrefs.insert(258, backref(5, BTRFS_FIRST_FREE_OBJECTID, "other"));

        let records = assemble_records(5, &roots, &backrefs, |tree, dirid| {
            assert_eq!((tree, dirid), (5, 300));
            Ok(".snapshots/1/".to_owned())
        })
        .expect("assemble");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, PathBuf::from(".snapshots/1/snapshot"));
        assert_eq!(records[0].root_id, 257);
        assert_eq!(records[0].ctransid, 10);
        assert_eq!(records[1].path, PathBuf::from("other"));
    }

    #[test]
    fn nested_subvolume_paths_chain_through_parents() {
        // base (5) ─ subvol 257 "outer" ─ dir (400) ─ subvol 258 "inner"
        let roots = vec![(257, [0; 16], 1), (258, [0; 16], 2)];
        let mut backrefs = HashMap::new();
        backrefs.insert(257, backref(5, BTRFS_FIRST_FREE_OBJECTID, "outer"));
        backrefs.insert(258, backref(257, 400, "inner"));

        let records = assemble_records(5, &roots, &backrefs, |tree, dirid| {
            assert_eq!((tree, dirid), (257, 400));
            Ok("nested/".to_owned())
        })
        .expect("assemble");

        let inner = records.iter().find(|r| r.root_id == 258).expect("inner");
        assert_eq!(inner.path, PathBuf::from("outer/nested/inner"));
    }

    #[test]
    fn unreachable_subvolumes_are_dropped() {
        // Subvol 258 hangs off root 99 which is not under the base.
        let roots = vec![(258, [0; 16], 2)];
        let mut backrefs = HashMap::new();
        backrefs.insert(258, backref(99, BTRFS_FIRST_FREE_OBJECTID, "stray"));

        let records =
            assemble_records(5, &roots, &backrefs, |_, _| Ok(String::new())).expect("assemble");
        assert!(records.is_empty());
    }

    #[test]
    fn index_lookup_by_relative_path() {
        let index = SubvolumeIndex {
            records: vec![SubvolumeRecord {
                path: PathBuf::from(".snapshots/1/snapshot"),
                root_id: 257,
                uuid: [0; 16],
                ctransid: 3,
            }],
        };
        assert_eq!(
            index.root_id_of(Path::new(".snapshots/1/snapshot")),
            Some(257)
        );
        assert_eq!(index.root_id_of(Path::new(".snapshots/2/snapshot")), None);
    }
}
