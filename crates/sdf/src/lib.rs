#![forbid(unsafe_code)]
//! SnapDiff public API facade.
//!
//! Re-exports the diff engine and its supporting types through one
//! stable interface. This is the crate downstream consumers (CLI,
//! snapshot managers) depend on.

pub use sdf_diff::*;
pub use sdf_error::{Result, SdfError};
pub use sdf_kernel::{SnapshotDir, SubvolumeIndex};
pub use sdf_types::{DiffEntry, Status, SubvolumeRecord};
