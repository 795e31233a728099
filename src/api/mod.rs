//! API Module
//!
//! Read-only REST API over the advertised VolumeClasses.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
