//! Custom Resource Definitions
//!
//! This module contains the resource types the operator works with:
//! - VolumePool: the managed pool resource
//! - VolumeClass: discovered capability classes
//! - CephBlockPool / CephClient: Rook resources backing a pool
//! - VolumeSnapshotClass: published snapshot class

pub mod rook;
pub mod snapshot;
pub mod volume_class;
pub mod volume_pool;

pub use rook::*;
pub use snapshot::*;
pub use volume_class::*;
pub use volume_pool::*;
