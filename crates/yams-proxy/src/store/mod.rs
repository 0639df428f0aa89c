//! Persistence gateway.
//!
//! The proxy reads configuration on every request and tolerates database
//! latency in favour of consistency; there is no in-process cache of
//! user-modifiable state. "Not found" is `None`, never an error.

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use crate::model::{AssetMeta, Profile, Route};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

/// Gateway operations consumed by the dispatcher and the script runtime.
///
/// Variable semantics (on the `storage` table):
/// - `(profile_id, sid-or-global, key)` holds at most one record;
/// - a read slides `expires_at` forward by the originally granted duration
///   (`expires_at - updated_at`) without touching `updated_at`;
/// - a write stamps `updated_at = now` and `expires_at = now + lifetime`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn profile_by_host(&self, host: &str) -> Result<Option<Profile>, StoreError>;

    /// All routes of a profile ordered by `(position, id)`.
    async fn routes_for_profile(&self, profile_id: i32) -> Result<Vec<Route>, StoreError>;

    async fn asset_meta(
        &self,
        profile_id: i32,
        path: &str,
    ) -> Result<Option<AssetMeta>, StoreError>;

    async fn asset_bytes(&self, asset_id: i32) -> Result<Bytes, StoreError>;

    /// Fetch an unexpired variable, sliding its expiry window.
    async fn get_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Upsert a variable with the given lifetime in seconds. The caller has
    /// already capped `lifetime` at the profile's `vars_lifetime`.
    async fn set_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
        value: &Value,
        lifetime: i64,
    ) -> Result<(), StoreError>;

    async fn delete_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
    ) -> Result<(), StoreError>;
}
