//! Engine API implementation submodules.
//!
//! Each submodule contains `impl ProvenanceEngine` blocks for one concern.
//! The struct definition remains in `lib.rs`.

mod builder;
mod identity;
mod inventory;
mod maintenance;

pub use builder::ProvenanceEngineBuilder;
