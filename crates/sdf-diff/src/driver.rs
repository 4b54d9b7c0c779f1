//! Diff driver.
//!
//! Validates the snapshots, resolves the parent root id, drives the
//! send pipeline into the change tree, runs the content-compare
//! post-pass, and emits the ordered report. The public wrapper
//! delegates to a caller-supplied generic comparator whenever the
//! send-stream path fails, so a diff always completes with some report
//! unless the fallback fails too.

use crate::aggregator::ChangeAggregator;
use crate::compare::compare_entry;
use crate::pipeline::{CancelFlag, run_pipeline};
use sdf_error::{Result, SdfError};
use sdf_kernel::{SnapshotDir, SubvolumeIndex, is_subvolume_read_only, send_subvolume};
use sdf_tree::ChangeTree;
use sdf_types::Status;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Callback contract shared by the send-stream diff and the fallback
/// comparator: invoked once per changed path, absolute, pre-order.
pub type DiffCallback<'a> = dyn FnMut(&Path, Status) + 'a;

/// One diff computation over a `(base, snapshot1, snapshot2)` triple.
/// Borrows the directory handles; no state outlives [`Self::compare`].
pub struct DiffEngine<'a> {
    base: &'a SnapshotDir,
    dir1: &'a SnapshotDir,
    dir2: &'a SnapshotDir,
}

impl<'a> DiffEngine<'a> {
    #[must_use]
    pub fn new(base: &'a SnapshotDir, dir1: &'a SnapshotDir, dir2: &'a SnapshotDir) -> Self {
        Self { base, dir1, dir2 }
    }

    /// Compute the diff via the kernel send stream and deliver results
    /// through `cb`. Nothing is emitted until the whole computation has
    /// succeeded, so a failed run leaves no partial report behind.
    pub fn compare<F: FnMut(&Path, Status)>(&self, mut cb: F) -> Result<()> {
        info!(
            dir1 = %self.dir1.path().display(),
            dir2 = %self.dir2.path().display(),
            "send-stream diff",
        );

        let base_is_subvolume = self
            .base
            .is_subvolume()
            .map_err(|err| SdfError::SendReceive(format!("stat of base failed: {err}")))?;
        if !base_is_subvolume {
            return Err(SdfError::SendReceive(format!(
                "base {} is not a subvolume root",
                self.base.path().display()
            )));
        }

        let read_only = is_subvolume_read_only(self.dir1.fd())
            .and_then(|ro1| Ok(ro1 && is_subvolume_read_only(self.dir2.fd())?))
            .map_err(|err| SdfError::SendReceive(format!("subvolume flags query: {err}")))?;
        if !read_only {
            return Err(SdfError::SendReceive(
                "snapshots are not read-only subvolumes".into(),
            ));
        }

        let relative = self.dir1.relative_to(self.base).ok_or_else(|| {
            SdfError::SendReceive(format!(
                "{} is not below base {}",
                self.dir1.path().display(),
                self.base.path().display()
            ))
        })?;
        let index = SubvolumeIndex::new(self.base)
            .map_err(|err| SdfError::SendReceive(format!("subvolume index: {err}")))?;
        let parent_root = index.root_id_of(&relative).ok_or_else(|| {
            SdfError::SendReceive(format!(
                "no subvolume found for {}",
                relative.display()
            ))
        })?;
        debug!(parent_root, "resolved parent subvolume");

        let clone_sources = vec![parent_root];
        let mut aggregator = ChangeAggregator::new(self.dir1);
        let cancel = CancelFlag::new();
        run_pipeline(
            |stream_out| {
                send_subvolume(
                    self.dir2.fd(),
                    stream_out.as_fd(),
                    parent_root,
                    &clone_sources,
                )
            },
            &mut aggregator,
            &cancel,
        )?;

        let mut tree = aggregator.into_tree();
        tree.dump();
        post_pass(&mut tree, &mut |path, _asked| {
            compare_entry(self.dir1, self.dir2, path)
        });
        emit(&tree, &mut cb);
        Ok(())
    }

    /// Public wrapper: on any send-stream failure, log it and start the
    /// caller's generic comparator from scratch with the same callback.
    pub fn compare_or_fallback<F, G>(&self, mut cb: F, fallback: G) -> Result<()>
    where
        F: FnMut(&Path, Status),
        G: FnOnce(&SnapshotDir, &SnapshotDir, &mut DiffCallback<'_>) -> Result<()>,
    {
        let start = Instant::now();
        match self.compare(&mut cb) {
            Ok(()) => {
                info!(elapsed_ms = start.elapsed().as_millis() as u64, "diff complete");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "send-stream diff failed, delegating to fallback comparator");
                fallback(self.dir1, self.dir2, &mut cb)
            }
        }
    }
}

/// Post-pass over the populated tree: collapse create/delete onto a
/// bare flag, then replace the attribute flags of every remaining
/// candidate with what `measure` observes on disk.
pub(crate) fn post_pass(
    tree: &mut ChangeTree,
    measure: &mut dyn FnMut(&str, Status) -> Status,
) {
    tree.refine(|path, status| {
        let mut status = status;
        if status.contains(Status::CREATED) {
            status = Status::CREATED;
        }
        if status.contains(Status::DELETED) {
            status = Status::DELETED;
        }
        if status.intersects(Status::ATTRIBUTES) {
            let asked = status & Status::ATTRIBUTES;
            status = status.without(Status::ATTRIBUTES) | measure(path, asked);
        }
        status
    });
}

/// Walk the refined tree pre-order and report every non-zero node with
/// an absolute path.
pub(crate) fn emit<F: FnMut(&Path, Status)>(tree: &ChangeTree, cb: &mut F) {
    tree.visit(|path, status| {
        if !status.is_empty() {
            let mut absolute = PathBuf::from("/");
            absolute.push(path);
            cb(&absolute, status);
        }
    });
}
