//! Event Delivery
//!
//! Generic list/watch event source that merges a live watch with periodic full
//! resyncs and fans the resulting events out to registered handlers.

pub mod source;

pub use source::*;
