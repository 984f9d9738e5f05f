//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use hydra_store::{KeySpace, Store};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::Result;

/// Key/value helpers scoped to `{prefix}:{service}:cache:`.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn Store>,
    keys: KeySpace,
    service: String,
}

impl Cache {
    /// Cache scoped to `service`.
    pub fn new(store: Arc<dyn Store>, keys: KeySpace, service: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            service: service.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        self.keys.cache(&self.service, key)
    }

    /// Store raw bytes, optionally expiring after `ttl`.
    pub async fn set_bytes(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let key = self.key(key);
        trace!(key = %key, ?ttl, "cache set");
        self.store.set(&key, value, ttl).await?;
        Ok(())
    }

    /// Raw bytes, or `None` when absent or expired.
    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get(&self.key(key)).await?)
    }

    /// Store a UTF-8 string.
    pub async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.set_bytes(key, value.as_bytes(), ttl).await
    }

    /// Non-UTF-8 values are decoded lossily.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get_bytes(key)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Stored as `1` / `0`.
    pub async fn set_bool(&self, key: &str, value: bool, ttl: Option<Duration>) -> Result<()> {
        self.set_string(key, if value { "1" } else { "0" }, ttl).await
    }

    /// Also accepts `true` / `false`. Any other value reads as `None`.
    pub async fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self
            .get_string(key)
            .await?
            .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            }))
    }

    /// Store `value` serialized as JSON.
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set_bytes(key, &bytes, ttl).await
    }

    /// Decode a JSON value. A value of another shape is an error.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns whether the key existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.store.del(&self.key(key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_store::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        hits: u32,
    }

    fn cache(store: &MemoryStore) -> Cache {
        Cache::new(Arc::new(store.clone()), KeySpace::default(), "svc")
    }

    #[tokio::test]
    async fn values_are_scoped_to_the_service() {
        let store = MemoryStore::new();
        let cache = cache(&store);
        cache.set_string("greeting", "hello", None).await.unwrap();

        assert!(store.contains_key("hydra:service:svc:cache:greeting"));
        assert_eq!(cache.get_string("greeting").await.unwrap().as_deref(), Some("hello"));
        assert_eq!(cache.get_string("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn bools_and_json() {
        let store = MemoryStore::new();
        let cache = cache(&store);

        cache.set_bool("flag", true, None).await.unwrap();
        assert_eq!(store.get("hydra:service:svc:cache:flag").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(cache.get_bool("flag").await.unwrap(), Some(true));
        cache.set_string("flag", "False", None).await.unwrap();
        assert_eq!(cache.get_bool("flag").await.unwrap(), Some(false));
        cache.set_string("flag", "maybe", None).await.unwrap();
        assert_eq!(cache.get_bool("flag").await.unwrap(), None);

        let session = Session { user: "ada".into(), hits: 3 };
        cache.set_json("session", &session, None).await.unwrap();
        assert_eq!(cache.get_json::<Session>("session").await.unwrap(), Some(session));

        assert!(cache.remove("session").await.unwrap());
        assert!(!cache.remove("session").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new();
        let cache = cache(&store);
        cache.set_bytes("blob", &[1, 2, 3], Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(cache.get_bytes("blob").await.unwrap(), Some(vec![1, 2, 3]));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.get_bytes("blob").await.unwrap(), None);
    }
}
