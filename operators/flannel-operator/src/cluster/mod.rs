//! 集群 API 模块
//!
//! 处理器只依赖每种资源的 get/list/create/replace/delete 五个操作。
//! 该模块定义这些操作的接口，并提供基于 kube-rs 的实现，测试使用内存实现。

mod kube_api;
#[cfg(test)]
mod memory;

pub use kube_api::KubeApi;
#[cfg(test)]
pub use memory::MemoryApi;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use std::sync::Arc;

use flannel_common::Result;

use crate::crd::FlannelConfig;

/// 单一资源类型的集群 API
///
/// `namespace` 为 `None` 时表示集群级资源，或在所有命名空间中列出。
/// 错误中的 404/409 通过 `Error::is_not_found` / `Error::is_already_exists` 识别。
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    /// 读取对象，不存在时返回 `None`
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// 按标签选择器列出对象
    async fn list(&self, namespace: Option<&str>, labels: Option<&str>) -> Result<Vec<K>>;

    /// 创建对象
    async fn create(&self, namespace: Option<&str>, obj: &K) -> Result<K>;

    /// 替换对象，对象中的 resourceVersion 用于冲突检测
    async fn replace(&self, namespace: Option<&str>, obj: &K) -> Result<K>;

    /// 删除对象
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()>;
}

/// 处理器使用的全部集群 API
#[derive(Clone)]
pub struct ClusterClients {
    pub namespaces: Arc<dyn ObjectApi<Namespace>>,
    pub service_accounts: Arc<dyn ObjectApi<ServiceAccount>>,
    pub cluster_role_bindings: Arc<dyn ObjectApi<ClusterRoleBinding>>,
    pub daemon_sets: Arc<dyn ObjectApi<DaemonSet>>,
    pub jobs: Arc<dyn ObjectApi<Job>>,
    pub pods: Arc<dyn ObjectApi<Pod>>,
    pub nodes: Arc<dyn ObjectApi<Node>>,
    pub flannel_configs: Arc<dyn ObjectApi<FlannelConfig>>,
}

impl ClusterClients {
    /// 基于 kube-rs 客户端创建
    pub fn from_client(client: kube::Client) -> Self {
        Self {
            namespaces: Arc::new(KubeApi::new(client.clone())),
            service_accounts: Arc::new(KubeApi::new(client.clone())),
            cluster_role_bindings: Arc::new(KubeApi::new(client.clone())),
            daemon_sets: Arc::new(KubeApi::new(client.clone())),
            jobs: Arc::new(KubeApi::new(client.clone())),
            pods: Arc::new(KubeApi::new(client.clone())),
            nodes: Arc::new(KubeApi::new(client.clone())),
            flannel_configs: Arc::new(KubeApi::new(client)),
        }
    }

    /// 创建内存实现
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            namespaces: Arc::new(MemoryApi::<Namespace>::new()),
            service_accounts: Arc::new(MemoryApi::<ServiceAccount>::new()),
            cluster_role_bindings: Arc::new(MemoryApi::<ClusterRoleBinding>::new()),
            daemon_sets: Arc::new(MemoryApi::<DaemonSet>::new()),
            jobs: Arc::new(MemoryApi::<Job>::new()),
            pods: Arc::new(MemoryApi::<Pod>::new()),
            nodes: Arc::new(MemoryApi::<Node>::new()),
            flannel_configs: Arc::new(MemoryApi::<FlannelConfig>::new()),
        }
    }
}

/// 创建对象，已存在时视为成功
pub async fn create_if_missing<K: Send + Sync>(api: &dyn ObjectApi<K>, namespace: Option<&str>, obj: &K) -> Result<bool> {
    match api.create(namespace, obj).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

/// 删除对象，不存在时视为成功
pub async fn delete_if_exists<K: Send + Sync>(api: &dyn ObjectApi<K>, namespace: Option<&str>, name: &str) -> Result<bool> {
    match api.delete(namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
