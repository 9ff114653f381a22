//! Identity resolution and the per-batch session cache.

mod identity;
mod session;

use crate::error::Result;
use crate::models::VersionRecord;
use async_trait::async_trait;

pub use identity::{BatchSummary, IdentityKey, IdentityResolver, TriggerWords};
pub use session::{PrewarmSummary, ResolutionSession, SessionCache};

/// Anything that can turn a registry version id into a version record.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn version_by_id(&self, version_id: i64) -> Result<Option<VersionRecord>>;
}
