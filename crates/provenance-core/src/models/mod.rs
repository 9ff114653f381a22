//! Data models for the provenance engine.
//!
//! `records` holds what the identity store persists; `registry` holds the
//! shapes of remote registry payloads as far as this engine reads them.

mod records;
mod registry;

pub use records::*;
pub use registry::*;
