//! 集群角色绑定处理器
//!
//! 为 flannel 服务账号绑定 `flannel-operator` 与 `flannel-operator-psp` 两个集群角色。

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use std::sync::Arc;
use tracing::{debug, info};

use flannel_common::Result;
use flannel_controller::{Flow, Patch, Resource};

use super::{new_cluster_role_binding, CLUSTER_ROLE, CLUSTER_ROLE_PSP};
use crate::cluster::{create_if_missing, delete_if_exists, ClusterClients, ObjectApi};
use crate::crd::FlannelConfig;
use crate::key;

/// 处理器名称
pub const NAME: &str = "clusterrolebindings";

/// 集群角色绑定处理器
pub struct ClusterRoleBindingResource {
    bindings: Arc<dyn ObjectApi<ClusterRoleBinding>>,
}

impl ClusterRoleBindingResource {
    pub fn new(clients: &ClusterClients) -> Self {
        Self {
            bindings: clients.cluster_role_bindings.clone(),
        }
    }

    fn desired_bindings(obj: &FlannelConfig) -> Vec<ClusterRoleBinding> {
        let namespace = key::network_namespace(obj);
        vec![
            new_cluster_role_binding(obj, &key::cluster_role_binding_name(obj), &namespace, CLUSTER_ROLE),
            new_cluster_role_binding(obj, &key::cluster_role_binding_psp_name(obj), &namespace, CLUSTER_ROLE_PSP),
        ]
    }
}

fn binding_name(binding: &ClusterRoleBinding) -> &str {
    binding.metadata.name.as_deref().unwrap_or_default()
}

/// 只比较受管字段，忽略 API Server 填充的元数据
fn has_drifted(current: &ClusterRoleBinding, desired: &ClusterRoleBinding) -> bool {
    current.role_ref != desired.role_ref
        || current.subjects != desired.subjects
        || current.metadata.labels != desired.metadata.labels
}

#[async_trait]
impl Resource<FlannelConfig> for ClusterRoleBindingResource {
    type State = Vec<ClusterRoleBinding>;

    fn name(&self) -> &str {
        NAME
    }

    async fn get_current_state(&self, obj: &FlannelConfig) -> Result<Flow<Self::State>> {
        let mut current = Vec::new();
        for name in [key::cluster_role_binding_name(obj), key::cluster_role_binding_psp_name(obj)] {
            match self.bindings.get(None, &name).await? {
                Some(binding) => current.push(binding),
                None => debug!(cluster = key::cluster_id(obj), binding = %name, "未找到集群角色绑定"),
            }
        }

        Ok(Flow::Continue(current))
    }

    async fn get_desired_state(&self, obj: &FlannelConfig) -> Result<Self::State> {
        Ok(Self::desired_bindings(obj))
    }

    fn new_update_patch(
        &self,
        _obj: &FlannelConfig,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        let mut to_create = Vec::new();
        let mut to_update = Vec::new();

        for binding in desired {
            match current.iter().find(|c| binding_name(c) == binding_name(binding)) {
                None => to_create.push(binding.clone()),
                Some(existing) if has_drifted(existing, binding) => to_update.push(binding.clone()),
                Some(_) => {}
            }
        }

        let mut patch = Patch::new();
        if !to_create.is_empty() {
            patch.set_create_change(to_create);
        }
        if !to_update.is_empty() {
            patch.set_update_change(to_update);
        }

        Ok(patch)
    }

    async fn apply_create_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        for binding in state {
            if create_if_missing(self.bindings.as_ref(), None, binding).await? {
                info!(cluster = key::cluster_id(obj), binding = binding_name(binding), "已创建集群角色绑定");
            } else {
                debug!(cluster = key::cluster_id(obj), binding = binding_name(binding), "集群角色绑定已存在");
            }
        }

        Ok(Flow::proceed())
    }

    async fn apply_update_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        // roleRef 不可修改，只能删除后重建
        for binding in state {
            delete_if_exists(self.bindings.as_ref(), None, binding_name(binding)).await?;
            create_if_missing(self.bindings.as_ref(), None, binding).await?;
            info!(cluster = key::cluster_id(obj), binding = binding_name(binding), "已重建集群角色绑定");
        }

        Ok(Flow::proceed())
    }

    async fn apply_delete_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        for binding in state {
            if delete_if_exists(self.bindings.as_ref(), None, binding_name(binding)).await? {
                info!(cluster = key::cluster_id(obj), binding = binding_name(binding), "已删除集群角色绑定");
            }
        }

        Ok(Flow::proceed())
    }
}
