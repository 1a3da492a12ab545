//! 内存集群 API
//!
//! 按名称与命名空间保存对象，返回与 API Server 相同的 404/409 错误，
//! 供处理器测试使用。

use async_trait::async_trait;
use kube::error::ErrorResponse;
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use flannel_common::{Error, Result};

use super::ObjectApi;

/// 内存实现
pub struct MemoryApi<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    resource_version: AtomicU64,
}

impl<K> Default for MemoryApi<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            resource_version: AtomicU64::new(1),
        }
    }
}

impl<K> MemoryApi<K> {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        self.resource_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), K>>> {
        self.objects
            .lock()
            .map_err(|_| Error::Unknown("内存存储锁已损坏".into()))
    }
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn object_key(namespace: Option<&str>, name: &str) -> (String, String) {
    (namespace.unwrap_or_default().to_string(), name.to_string())
}

/// 判断标签是否满足 `k=v`、`k!=v`、`k` 形式的选择器
fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let empty = BTreeMap::new();
    let labels = labels.unwrap_or(&empty);

    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once('=') {
                let v = v.trim_start_matches('=');
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

#[async_trait]
impl<K> ObjectApi<K> for MemoryApi<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let objects = self.lock()?;
        Ok(objects.get(&object_key(namespace, name)).cloned())
    }

    async fn list(&self, namespace: Option<&str>, labels: Option<&str>) -> Result<Vec<K>> {
        let objects = self.lock()?;
        Ok(objects
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |n| n == ns))
            .filter(|(_, obj)| labels.map_or(true, |s| matches_selector(obj.meta().labels.as_ref(), s)))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, namespace: Option<&str>, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| api_error(422, "Invalid", "name is required".into()))?;
        let key = object_key(namespace, &name);

        let mut objects = self.lock()?;
        if objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }

        let mut stored = obj.clone();
        stored.meta_mut().namespace = namespace.map(str::to_string);
        stored.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, stored.clone());

        Ok(stored)
    }

    async fn replace(&self, namespace: Option<&str>, obj: &K) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| api_error(422, "Invalid", "name is required".into()))?;
        let key = object_key(namespace, &name);

        let mut objects = self.lock()?;
        let Some(existing) = objects.get(&key) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };

        if let Some(version) = &obj.meta().resource_version {
            if existing.meta().resource_version.as_ref() != Some(version) {
                return Err(api_error(409, "Conflict", format!("{name} has been modified")));
            }
        }

        let mut stored = obj.clone();
        stored.meta_mut().namespace = namespace.map(str::to_string);
        stored.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key, stored.clone());

        Ok(stored)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut objects = self.lock()?;
        match objects.remove(&object_key(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound", format!("{name} not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;

    fn pod(name: &str, app: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let api = MemoryApi::<Pod>::new();
        api.create(Some("a"), &pod("p1", "x")).await.unwrap();

        let err = api.create(Some("a"), &pod("p1", "x")).await.unwrap_err();
        assert!(err.is_already_exists());
        // 不同命名空间互不影响
        api.create(Some("b"), &pod("p1", "x")).await.unwrap();

        assert!(api.get(Some("a"), "p1").await.unwrap().is_some());
        api.delete(Some("a"), "p1").await.unwrap();
        assert!(api.get(Some("a"), "p1").await.unwrap().is_none());
        assert!(api.delete(Some("a"), "p1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_with_selector() {
        let api = MemoryApi::<Pod>::new();
        api.create(Some("a"), &pod("p1", "flannel-network")).await.unwrap();
        api.create(Some("a"), &pod("p2", "other")).await.unwrap();
        api.create(Some("b"), &pod("p3", "flannel-network")).await.unwrap();

        assert_eq!(api.list(Some("a"), None).await.unwrap().len(), 2);
        assert_eq!(api.list(None, Some("app=flannel-network")).await.unwrap().len(), 2);
        assert_eq!(api.list(Some("a"), Some("app!=other")).await.unwrap().len(), 1);
        assert_eq!(api.list(None, Some("missing")).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_replace_detects_conflicts() {
        let api = MemoryApi::<Pod>::new();
        let created = api.create(Some("a"), &pod("p1", "x")).await.unwrap();

        let updated = api.replace(Some("a"), &created).await.unwrap();
        assert_ne!(updated.metadata.resource_version, created.metadata.resource_version);

        // 使用旧版本替换会冲突
        let err = api.replace(Some("a"), &created).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_already_exists());

        assert!(api.replace(Some("a"), &pod("p9", "x")).await.unwrap_err().is_not_found());
    }
}
