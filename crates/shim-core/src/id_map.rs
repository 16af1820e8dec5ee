//! Indexed, mutex-guarded id -> entity maps.
//!
//! Used both for the shim-wide container index and for each container's
//! exec index. `get` on a missing id returns `NotFound`; `remove` is
//! idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Error, Result};

pub struct IdMap<V> {
    inner: RwLock<HashMap<String, Arc<V>>>,
}

impl<V> Default for IdMap<V> {
    fn default() -> Self {
        Self {
            inner: RwLock::default(),
        }
    }
}

impl<V> IdMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: impl Into<String>, val: Arc<V>) -> Result<()> {
        let id = id.into();
        let mut guard = self.inner.write().await;
        if guard.contains_key(&id) {
            return Err(Error::AlreadyExists(id));
        }
        guard.insert(id, val);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Arc<V>> {
        self.inner
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub async fn try_get(&self, id: &str) -> Option<Arc<V>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    /// Idempotent: removing a missing id is not an error.
    pub async fn remove(&self, id: &str) -> Option<Arc<V>> {
        self.inner.write().await.remove(id)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn values(&self) -> Vec<Arc<V>> {
        self.inner.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_get() {
        let m = IdMap::<u32>::new();
        m.insert("a", Arc::new(1)).await.unwrap();
        assert_eq!(*m.get("a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_already_exists() {
        let m = IdMap::<u32>::new();
        m.insert("a", Arc::new(1)).await.unwrap();
        let err = m.insert("a", Arc::new(2)).await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::AlreadyExists);
    }

    #[tokio::test]
    async fn missing_get_is_not_found() {
        let m = IdMap::<u32>::new();
        let err = m.get("missing").await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::NotFound);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let m = IdMap::<u32>::new();
        m.insert("a", Arc::new(1)).await.unwrap();
        assert!(m.remove("a").await.is_some());
        assert!(m.remove("a").await.is_none());
        assert!(m.is_empty().await);
    }
}
