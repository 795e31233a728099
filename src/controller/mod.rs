//! VolumePool Controller
//!
//! - `naming`: pool names and the labels put on child resources
//! - `reconciler`: one convergence pass for a VolumePool
//! - `queue`: de-duplicating work queue with retry backoff
//! - `runner`: event wiring and reconcile workers

pub mod naming;
pub mod queue;
pub mod reconciler;
pub mod runner;

pub use naming::{cluster_pool_name, MANAGER, POOL_LABEL};
pub use queue::WorkQueue;
pub use reconciler::{PoolStores, ReconcilerConfig, VolumePoolReconciler};
pub use runner::{ControllerOptions, VolumePoolController};
