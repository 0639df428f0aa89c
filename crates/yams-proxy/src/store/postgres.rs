//! PostgreSQL gateway backed by a shared `sqlx` pool.
//!
//! The schema is owned by the admin console; this side only issues the
//! queries below. `sid IS NOT DISTINCT FROM $n` keeps global (NULL sid) and
//! session-scoped rows addressable through one statement.

use super::{Storage, StoreError};
use crate::model::{AssetMeta, Profile, Route};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn profile_by_host(&self, host: &str) -> Result<Option<Profile>, StoreError> {
        let row = sqlx::query(
            "SELECT id, backend, debug, vars_lifetime FROM profiles WHERE $1 = ANY(hosts)",
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Profile {
            id: r.get("id"),
            backend: r.get("backend"),
            is_debug: r.get("debug"),
            vars_lifetime: r.get::<i32, _>("vars_lifetime") as i64,
        }))
    }

    async fn routes_for_profile(&self, profile_id: i32) -> Result<Vec<Route>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, uuid, profile_id, position, methods, path, path_re, path_args, \
                    adapter, script, timeout, hint, is_enabled \
             FROM routes WHERE profile_id = $1 ORDER BY position, id",
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Route {
                id: r.get("id"),
                uuid: r.get::<uuid::Uuid, _>("uuid").to_string(),
                profile_id: r.get("profile_id"),
                position: r.get("position"),
                methods: r.get("methods"),
                path: r.get("path"),
                path_re: r.get("path_re"),
                path_args: r.get("path_args"),
                adapter: r.get("adapter"),
                script: r.get("script"),
                timeout: r.get::<i32, _>("timeout") as i64,
                hint: r.get("hint"),
                is_enabled: r.get("is_enabled"),
            })
            .collect())
    }

    async fn asset_meta(
        &self,
        profile_id: i32,
        path: &str,
    ) -> Result<Option<AssetMeta>, StoreError> {
        let row = sqlx::query(
            "SELECT id, profile_id, path, mime_type, octet_length(data) AS size \
             FROM assets WHERE profile_id = $1 AND path = $2",
        )
        .bind(profile_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AssetMeta {
            id: r.get("id"),
            profile_id: r.get("profile_id"),
            path: r.get("path"),
            mime_type: r.get("mime_type"),
            size: r.get::<i32, _>("size") as i64,
        }))
    }

    async fn asset_bytes(&self, asset_id: i32) -> Result<Bytes, StoreError> {
        let row = sqlx::query("SELECT data FROM assets WHERE id = $1")
            .bind(asset_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| Bytes::from(r.get::<Vec<u8>, _>("data")))
            .unwrap_or_default())
    }

    async fn get_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        // Read and expiry-touch in one statement: the slide keeps the
        // originally granted duration and leaves updated_at alone.
        let row = sqlx::query(
            "UPDATE storage SET expires_at = now() + (expires_at - updated_at) \
             WHERE profile_id = $1 AND sid IS NOT DISTINCT FROM $2 AND key = $3 \
               AND expires_at > now() \
             RETURNING value",
        )
        .bind(profile_id)
        .bind(sid)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<Value, _>("value")))
    }

    async fn set_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
        value: &Value,
        lifetime: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO storage (profile_id, sid, key, value, updated_at, expires_at) \
             VALUES ($1, $2, $3, $4, now(), now() + $5 * INTERVAL '1 second') \
             ON CONFLICT (COALESCE(sid, ''), profile_id, key) \
             DO UPDATE SET value = EXCLUDED.value, updated_at = now(), \
                           expires_at = EXCLUDED.expires_at",
        )
        .bind(profile_id)
        .bind(sid)
        .bind(key)
        .bind(value)
        .bind(lifetime)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM storage \
             WHERE profile_id = $1 AND sid IS NOT DISTINCT FROM $2 AND key = $3",
        )
        .bind(profile_id)
        .bind(sid)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
