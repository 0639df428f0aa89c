//! In-memory gateway.
//!
//! Mirrors the relational semantics closely enough for unit, property and
//! end-to-end tests to run without PostgreSQL. Variable clocks use
//! `tokio::time::Instant` so TTL behaviour is testable under paused time.

use super::{Storage, StoreError};
use crate::model::{AssetMeta, Profile, Route};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct VarRecord {
    value: Value,
    updated_at: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    profiles: Vec<(Vec<String>, Profile)>,
    routes: HashMap<i32, Vec<Route>>,
    assets: HashMap<i32, (AssetMeta, Bytes)>,
    asset_paths: HashMap<(i32, String), i32>,
    vars: HashMap<(i32, Option<String>, String), VarRecord>,
    next_asset_id: i32,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_profile(&self, hosts: &[&str], profile: Profile) {
        let hosts = hosts.iter().map(|h| h.to_string()).collect();
        self.inner.lock().profiles.push((hosts, profile));
    }

    pub fn add_route(&self, route: Route) {
        let mut inner = self.inner.lock();
        let routes = inner.routes.entry(route.profile_id).or_default();
        routes.push(route);
        routes.sort_by_key(|r| (r.position, r.id));
    }

    pub fn add_asset(&self, profile_id: i32, path: &str, mime_type: &str, data: Bytes) -> i32 {
        let mut inner = self.inner.lock();
        inner.next_asset_id += 1;
        let id = inner.next_asset_id;
        let meta = AssetMeta {
            id,
            profile_id,
            path: path.to_string(),
            mime_type: mime_type.to_string(),
            size: data.len() as i64,
        };
        inner.assets.insert(id, (meta, data));
        inner.asset_paths.insert((profile_id, path.to_string()), id);
        id
    }

    /// Raw record peek for TTL assertions.
    pub fn var_window(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
    ) -> Option<(Instant, Instant)> {
        let inner = self.inner.lock();
        inner
            .vars
            .get(&(profile_id, sid.map(str::to_string), key.to_string()))
            .map(|r| (r.updated_at, r.expires_at))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn profile_by_host(&self, host: &str) -> Result<Option<Profile>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .profiles
            .iter()
            .find(|(hosts, _)| hosts.iter().any(|h| h == host))
            .map(|(_, p)| p.clone()))
    }

    async fn routes_for_profile(&self, profile_id: i32) -> Result<Vec<Route>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.routes.get(&profile_id).cloned().unwrap_or_default())
    }

    async fn asset_meta(
        &self,
        profile_id: i32,
        path: &str,
    ) -> Result<Option<AssetMeta>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .asset_paths
            .get(&(profile_id, path.to_string()))
            .and_then(|id| inner.assets.get(id))
            .map(|(meta, _)| meta.clone()))
    }

    async fn asset_bytes(&self, asset_id: i32) -> Result<Bytes, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .assets
            .get(&asset_id)
            .map(|(_, data)| data.clone())
            .unwrap_or_default())
    }

    async fn get_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let mut inner = self.inner.lock();
        let key = (profile_id, sid.map(str::to_string), key.to_string());
        let now = Instant::now();
        match inner.vars.get_mut(&key) {
            Some(record) if record.expires_at > now => {
                // Slide by the originally granted duration; updated_at stays.
                let granted = record.expires_at - record.updated_at;
                record.expires_at = now + granted;
                Ok(Some(record.value.clone()))
            }
            Some(_) => {
                inner.vars.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
        value: &Value,
        lifetime: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.vars.insert(
            (profile_id, sid.map(str::to_string), key.to_string()),
            VarRecord {
                value: value.clone(),
                updated_at: now,
                expires_at: now + Duration::from_secs(lifetime.max(0) as u64),
            },
        );
        Ok(())
    }

    async fn delete_var(
        &self,
        profile_id: i32,
        sid: Option<&str>,
        key: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .vars
            .remove(&(profile_id, sid.map(str::to_string), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile() -> Profile {
        Profile {
            id: 1,
            backend: None,
            is_debug: false,
            vars_lifetime: 3600,
        }
    }

    #[tokio::test]
    async fn profile_lookup_by_any_host() {
        let store = MemoryStorage::new();
        store.add_profile(&["a.test", "b.test"], profile());
        assert!(store.profile_by_host("b.test").await.unwrap().is_some());
        assert!(store.profile_by_host("c.test").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn get_var_slides_expiry_keeping_granted_duration() {
        let store = MemoryStorage::new();
        store
            .set_var(1, None, "k", &json!("v"), 10)
            .await
            .unwrap();
        let (u0, e0) = store.var_window(1, None, "k").unwrap();
        assert_eq!(e0 - u0, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(5)).await;
        let v = store.get_var(1, None, "k").await.unwrap();
        assert_eq!(v, Some(json!("v")));

        let (u1, e1) = store.var_window(1, None, "k").unwrap();
        assert_eq!(u1, u0, "updated_at must not move on read");
        assert_eq!(e1 - Instant::now(), Duration::from_secs(10));

        // A second read without a write grants the same window again.
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get_var(1, None, "k").await.unwrap().is_some());
        let (u2, e2) = store.var_window(1, None, "k").unwrap();
        assert_eq!(u2, u0);
        assert_eq!(e2 - Instant::now(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn get_var_expires() {
        let store = MemoryStorage::new();
        store.set_var(1, None, "k", &json!(1), 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get_var(1, None, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_scope_is_distinct_from_global() {
        let store = MemoryStorage::new();
        store.set_var(1, None, "k", &json!("g"), 60).await.unwrap();
        store
            .set_var(1, Some("sid1"), "k", &json!("s"), 60)
            .await
            .unwrap();
        assert_eq!(store.get_var(1, None, "k").await.unwrap(), Some(json!("g")));
        assert_eq!(
            store.get_var(1, Some("sid1"), "k").await.unwrap(),
            Some(json!("s"))
        );
        assert!(store.get_var(1, Some("sid2"), "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_var_upserts_single_record() {
        let store = MemoryStorage::new();
        store.set_var(1, None, "k", &json!(1), 60).await.unwrap();
        store.set_var(1, None, "k", &json!(2), 60).await.unwrap();
        assert_eq!(store.get_var(1, None, "k").await.unwrap(), Some(json!(2)));
        store.delete_var(1, None, "k").await.unwrap();
        assert!(store.get_var(1, None, "k").await.unwrap().is_none());
    }
}
