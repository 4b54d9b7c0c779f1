#![forbid(unsafe_code)]
//! Send-stream snapshot diff.
//!
//! Given two read-only snapshots of the same subvolume lineage, this
//! crate asks the kernel for an incremental send stream describing the
//! second relative to the first, folds the stream into a change tree,
//! re-measures every attribute-touched path against both snapshots,
//! and reports `(path, status)` pairs through a callback, without
//! ever walking and hashing the full trees.

mod aggregator;
mod compare;
mod driver;
mod pipeline;

pub use aggregator::ChangeAggregator;
pub use compare::{compare_entry, is_acl_signature, ACL_ACCESS_XATTR, ACL_DEFAULT_XATTR};
pub use driver::{DiffCallback, DiffEngine};
pub use pipeline::{run_pipeline, CancelFlag};
