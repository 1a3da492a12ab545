//! 网络命名空间处理器
//!
//! flanneld DaemonSet 与服务账号运行在 `flannel-network-<集群标识>` 命名空间中。

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use std::sync::Arc;
use tracing::{debug, info};

use flannel_common::Result;
use flannel_controller::{Flow, Patch, Resource};

use super::{is_terminating, new_namespace};
use crate::cluster::{create_if_missing, delete_if_exists, ClusterClients, ObjectApi};
use crate::crd::FlannelConfig;
use crate::key;

/// 处理器名称
pub const NAME: &str = "namespace";

/// 网络命名空间处理器
pub struct NamespaceResource {
    namespaces: Arc<dyn ObjectApi<Namespace>>,
}

impl NamespaceResource {
    pub fn new(clients: &ClusterClients) -> Self {
        Self {
            namespaces: clients.namespaces.clone(),
        }
    }
}

#[async_trait]
impl Resource<FlannelConfig> for NamespaceResource {
    type State = Option<Namespace>;

    fn name(&self) -> &str {
        NAME
    }

    async fn get_current_state(&self, obj: &FlannelConfig) -> Result<Flow<Self::State>> {
        let name = key::network_namespace(obj);
        let current = self.namespaces.get(None, &name).await?;

        match &current {
            Some(ns) if is_terminating(ns) => {
                // 命名空间删除完成前无法在其中创建资源
                debug!(cluster = key::cluster_id(obj), namespace = %name, "命名空间正在终止，取消本轮协调");
                return Ok(Flow::Cancel);
            }
            Some(_) => debug!(cluster = key::cluster_id(obj), namespace = %name, "找到命名空间"),
            None => debug!(cluster = key::cluster_id(obj), namespace = %name, "未找到命名空间"),
        }

        Ok(Flow::Continue(current))
    }

    async fn get_desired_state(&self, obj: &FlannelConfig) -> Result<Self::State> {
        Ok(Some(new_namespace(obj, &key::network_namespace(obj), key::NETWORK_ID)))
    }

    fn new_update_patch(
        &self,
        _obj: &FlannelConfig,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        // 命名空间只需存在，不做更新
        let mut patch = Patch::new();
        if current.is_none() {
            if let Some(ns) = desired {
                patch.set_create_change(Some(ns.clone()));
            }
        }
        Ok(patch)
    }

    async fn apply_create_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        if let Some(ns) = state {
            if create_if_missing(self.namespaces.as_ref(), None, ns).await? {
                info!(cluster = key::cluster_id(obj), namespace = ?ns.metadata.name, "已创建命名空间");
            }
        }
        Ok(Flow::proceed())
    }

    async fn apply_update_change(&self, _obj: &FlannelConfig, _state: &Self::State) -> Result<Flow<()>> {
        Ok(Flow::proceed())
    }

    async fn apply_delete_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        if let Some(name) = state.as_ref().and_then(|ns| ns.metadata.name.as_deref()) {
            if delete_if_exists(self.namespaces.as_ref(), None, name).await? {
                info!(cluster = key::cluster_id(obj), namespace = %name, "已删除命名空间");
            }
        }
        Ok(Flow::proceed())
    }
}
