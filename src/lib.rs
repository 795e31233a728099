//! Volume Pool Operator
//!
//! A Kubernetes operator that publishes VolumePools backed by Rook/Ceph block
//! pools. For every VolumePool of its provider it creates the backing
//! CephBlockPool, mirrors the pool phase into the VolumePool status, and once
//! the pool is ready hands out credentials, storage and snapshot classes and
//! the list of VolumeClasses the pool can serve.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Kubernetes API                               │
//! └───────┬──────────────┬──────────────┬──────────────┬─────────────────┘
//!         │ list/watch   │              │              │
//! ┌───────┴──────┐ ┌─────┴──────┐ ┌─────┴──────┐ ┌─────┴──────┐
//! │  VolumePool  │ │CephBlockPool│ │ CephClient │ │VolumeClass │  ListWatchSource
//! └───────┬──────┘ └─────┬──────┘ └─────┬──────┘ └──┬──────┬──┘
//!         │              │ pool label   │           │      │
//!         └──────────────┴──────┬───────┴───────────┘      │
//!                               │                           │
//!                     ┌─────────┴─────────┐      ┌──────────┴─────────┐
//!                     │     WorkQueue     │      │ VolumeClassRegistry│──► REST API
//!                     └─────────┬─────────┘      └────────────────────┘
//!                               │
//!                     ┌─────────┴─────────┐
//!                     │ VolumePoolReconciler│──► CephBlockPool, CephClient,
//!                     └───────────────────┘    Secret, StorageClass,
//!                                              VolumeSnapshotClass, status
//! ```
//!
//! # Modules
//!
//! - [`event`]: list/watch event source with handler fan-out
//! - [`controller`]: reconciler, work queue and workers
//! - [`store`]: Kubernetes and in-memory object stores
//! - [`crd`]: resource types
//! - [`domain`]: ports between the engine and the platform
//! - [`error`]: error types and requeue policy

pub mod announcer;
pub mod api;
pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod event;
pub mod metrics;
pub mod operator;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigOverrides, OperatorConfig};

pub use controller::{
    cluster_pool_name, ControllerOptions, PoolStores, ReconcilerConfig, VolumePoolController,
    VolumePoolReconciler, WorkQueue,
};

pub use crd::{
    CephBlockPool, CephClient, CephPhase, ClassReference, VolumeClass, VolumeClassSpec,
    VolumePool, VolumePoolSpec, VolumePoolState, VolumePoolStatus, VolumeSnapshotClass,
};

pub use domain::ports::{
    LabelSelector, ListWatch, Object, ObjectKey, ObjectStore, OwnershipMarker, Watch,
    WatchEvent, WatchEventType,
};

pub use error::{Error, ErrorAction, Result};

pub use event::{Event, EventType, Handler, HandlerRegistration, ListWatchSource, ListWatchSourceOptions, Source};

pub use metrics::Metrics;

pub use operator::{Backends, MemoryBackend, Operator, OperatorSettings};

pub use registry::VolumeClassRegistry;

pub use store::{KubeStore, MemoryStore};

/// Operator version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Operator name
pub const NAME: &str = "volume-pool-operator";
