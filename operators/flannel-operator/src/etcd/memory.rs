//! 内存配置存储
//!
//! 与 etcd v2 语义一致的内存实现，供测试使用。

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use flannel_common::{Error, Result};

use super::{normalize_key, Store};

/// 内存键值存储
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前所有键
    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

fn is_below(key: &str, dir: &str) -> bool {
    key.strip_prefix(dir).map_or(false, |rest| rest.starts_with('/'))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, key: &str, value: &str) -> Result<()> {
        let key = normalize_key(key);
        let mut entries = self.entries.write().await;

        if entries.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }
        entries.insert(key, value.to_string());

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = normalize_key(key);
        let mut entries = self.entries.write().await;

        let before = entries.len();
        entries.retain(|k, _| k != &key && !is_below(k, &key));
        if entries.len() == before {
            return Err(Error::NotFound(key));
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = normalize_key(key);
        let entries = self.entries.read().await;
        Ok(entries.keys().any(|k| k == &key || is_below(k, &key)))
    }

    async fn list(&self, key: &str) -> Result<Vec<String>> {
        let key = normalize_key(key);
        let entries = self.entries.read().await;

        let values: Vec<String> = entries
            .iter()
            .filter(|(k, _)| is_below(k, &key) && !k[key.len() + 1..].contains('/'))
            .map(|(_, v)| v.clone())
            .collect();
        if values.is_empty() && !entries.keys().any(|k| is_below(k, &key)) {
            return Err(Error::NotFound(key));
        }

        Ok(values)
    }

    async fn search(&self, key: &str) -> Result<String> {
        let key = normalize_key(key);
        let entries = self.entries.read().await;

        if let Some(value) = entries.get(&key) {
            return Ok(value.clone());
        }

        let mut children = entries.iter().filter(|(k, _)| is_below(k, &key));
        match (children.next(), children.next()) {
            (None, _) => Err(Error::NotFound(key)),
            (Some((_, value)), None) => Ok(value.clone()),
            (Some(_), Some(_)) => Err(Error::MultipleValues(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_idempotent_with_already_exists() {
        let store = MemoryStore::new();
        store.create("/coreos.com/network/br-a/config", "{}").await.unwrap();

        let err = store.create("coreos.com/network/br-a/config", "{}").await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.keys().await, vec!["coreos.com/network/br-a/config"]);
    }

    #[tokio::test]
    async fn test_delete_is_recursive_and_reports_not_found() {
        let store = MemoryStore::new();
        store.create("coreos.com/network/br-a/config", "{}").await.unwrap();
        store.create("coreos.com/network/br-a/subnets/10.0.0.0-30", "{}").await.unwrap();
        store.create("coreos.com/network/br-ab/config", "{}").await.unwrap();

        store.delete("coreos.com/network/br-a").await.unwrap();
        assert_eq!(store.keys().await, vec!["coreos.com/network/br-ab/config"]);

        let err = store.delete("coreos.com/network/br-a").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_search() {
        let store = MemoryStore::new();
        assert!(store.search("a/b").await.unwrap_err().is_not_found());

        store.create("a/b/c", "1").await.unwrap();
        assert_eq!(store.search("a/b/c").await.unwrap(), "1");
        // 目录下只有一个值时返回该值
        assert_eq!(store.search("a/b").await.unwrap(), "1");

        store.create("a/b/d", "2").await.unwrap();
        assert!(store.search("a/b").await.unwrap_err().is_multiple_values());

        assert!(store.exists("a").await.unwrap());
        assert!(!store.exists("a/x").await.unwrap());
        assert_eq!(store.list("a/b").await.unwrap(), vec!["1", "2"]);
        assert!(store.list("z").await.unwrap_err().is_not_found());
    }
}
