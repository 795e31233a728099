//! Object Store Adapters
//!
//! Implementations of [`crate::domain::ObjectStore`]: one over the Kubernetes
//! API and one in process memory.

pub mod kube;
pub mod memory;

pub use self::kube::KubeStore;
pub use self::memory::MemoryStore;
