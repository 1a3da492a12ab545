//! 网络配置处理器
//!
//! 在配置存储中维护 flanneld 读取的网络配置条目。条目的 (CIDR, 子网长度, VNI)
//! 任一变化都会删除整个网络根路径后重新写入，旧网络下的子网租约随之清除。

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use flannel_common::{NetworkConfig, Result};
use flannel_controller::{Flow, Patch, Resource};

use crate::crd::FlannelConfig;
use crate::etcd::Store;
use crate::key;

/// 处理器名称
pub const NAME: &str = "networkconfig";

/// 网络配置处理器
pub struct NetworkConfigResource {
    store: Arc<dyn Store>,
}

impl NetworkConfigResource {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn write_config(&self, obj: &FlannelConfig, config: &NetworkConfig) -> Result<()> {
        let path = key::etcd_network_config_path(obj);
        match self.store.create(&path, &config.to_json()?).await {
            Ok(()) => info!(cluster = key::cluster_id(obj), path = %path, "已写入网络配置"),
            Err(e) if e.is_already_exists() => {
                debug!(cluster = key::cluster_id(obj), path = %path, "网络配置已存在")
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn delete_network(&self, obj: &FlannelConfig) -> Result<()> {
        let path = key::etcd_network_path(obj);
        match self.store.delete(&path).await {
            Ok(()) => info!(cluster = key::cluster_id(obj), path = %path, "已删除网络配置"),
            Err(e) if e.is_not_found() => {
                debug!(cluster = key::cluster_id(obj), path = %path, "网络配置不存在")
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[async_trait]
impl Resource<FlannelConfig> for NetworkConfigResource {
    type State = NetworkConfig;

    fn name(&self) -> &str {
        NAME
    }

    async fn get_current_state(&self, obj: &FlannelConfig) -> Result<Flow<Self::State>> {
        let path = key::etcd_network_config_path(obj);
        let current = match self.store.search(&path).await {
            Ok(value) => NetworkConfig::from_json(&value)?,
            Err(e) if e.is_not_found() => {
                debug!(cluster = key::cluster_id(obj), path = %path, "未找到网络配置");
                NetworkConfig::default()
            }
            Err(e) => return Err(e),
        };

        Ok(Flow::Continue(current))
    }

    async fn get_desired_state(&self, obj: &FlannelConfig) -> Result<Self::State> {
        let network = &obj.spec.flannel.spec;
        Ok(NetworkConfig::vxlan(&network.network, network.subnet_len, network.vni))
    }

    fn new_update_patch(
        &self,
        _obj: &FlannelConfig,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        let mut patch = Patch::new();
        if current.is_empty() {
            if !desired.is_empty() {
                patch.set_create_change(desired.clone());
            }
        } else if !current.same_network(desired) {
            patch.set_update_change(desired.clone());
        }

        Ok(patch)
    }

    async fn apply_create_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        self.write_config(obj, state).await?;
        Ok(Flow::proceed())
    }

    async fn apply_update_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        info!(cluster = key::cluster_id(obj), "网络配置已变化，重建网络根路径");
        self.delete_network(obj).await?;
        self.write_config(obj, state).await?;
        Ok(Flow::proceed())
    }

    async fn apply_delete_change(&self, obj: &FlannelConfig, _state: &Self::State) -> Result<Flow<()>> {
        self.delete_network(obj).await?;
        Ok(Flow::proceed())
    }
}
