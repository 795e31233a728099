//! Domain layer - Core port definitions
//!
//! This module defines the traits (ports) the platform adapters implement,
//! following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
