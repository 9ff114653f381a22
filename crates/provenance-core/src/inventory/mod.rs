//! Local model inventory: categories, hashing, directory providers, sync
//! and embedded training metadata.

mod category;
pub mod hashing;
mod index;
pub mod legacy;
pub mod provider;
pub mod safetensors;
mod scanner;

pub use category::ModelCategory;
pub use hashing::{compute_sha256, normalize_hash, short_hash};
pub use index::LocalHashIndex;
pub use legacy::{migrate_legacy_caches, MigrationReport};
pub use provider::{FolderLayout, ModelDirectories};
pub use scanner::{file_mtime_ns, InventoryScanner, SyncReport};
