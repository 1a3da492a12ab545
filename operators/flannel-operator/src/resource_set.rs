//! 资源集合
//!
//! 为每个版本包组装有序的处理器列表。每个处理器外层依次包装重试与指标装饰器，
//! 两代集合共享同一组指标。

use prometheus::Registry;
use std::sync::Arc;
use tracing::info;

use flannel_common::{Error, Result};
use flannel_controller::{
    BackoffPolicy, Handler, MetricsResource, Resource, ResourceMetrics, ResourceRouter, ResourceSet,
    RetryResource,
};

use crate::cluster::ClusterClients;
use crate::config::EtcdConfig;
use crate::crd::FlannelConfig;
use crate::etcd::Store;
use crate::resource::flanneld::{self, LOCAL_ETCD_ENDPOINT};
use crate::resource::{
    ClusterRoleBindingResource, FlanneldConfig, FlanneldResource, LegacyResource, NamespaceResource,
    NetworkConfigResource,
};
use crate::version_bundle::{flannel_version, VERSION_0_1_0, VERSION_0_2_0};

/// 组装资源集合所需的依赖
pub struct ResourceSetConfig {
    pub clients: ClusterClients,
    pub store: Arc<dyn Store>,
    pub etcd: EtcdConfig,
    /// 处理器操作的退避策略
    pub retry: BackoffPolicy,
    /// 清理任务的退避策略
    pub teardown: BackoffPolicy,
}

/// 一个版本包的差异部分
struct Generation {
    version: &'static str,
    etcd_endpoints: Vec<String>,
    health_sidecar: bool,
}

/// 创建版本路由，未记录版本的对象由 0.1.0 处理
pub fn new_resource_routers(
    config: &ResourceSetConfig,
    registry: &Registry,
) -> Result<Vec<ResourceRouter<FlannelConfig>>> {
    let metrics = ResourceMetrics::new(registry)?;
    let version_gauge = flanneld::new_version_gauge(registry)?;

    let generations = [
        Generation {
            version: VERSION_0_1_0,
            etcd_endpoints: vec![LOCAL_ETCD_ENDPOINT.to_string()],
            health_sidecar: false,
        },
        Generation {
            version: VERSION_0_2_0,
            etcd_endpoints: config.etcd.endpoints.clone(),
            health_sidecar: true,
        },
    ];

    let mut sets = Vec::with_capacity(generations.len());
    for generation in generations {
        let flannel = flannel_version(generation.version).ok_or_else(|| {
            Error::InvalidConfig(format!("版本包 {} 缺少 flannel 组件", generation.version))
        })?;
        let flanneld_config = FlanneldConfig {
            version_bundle: generation.version.to_string(),
            image: flanneld::flannel_image(&flannel),
            etcd_endpoints: generation.etcd_endpoints,
            etcd_ca_file: config.etcd.ca_file.clone(),
            etcd_crt_file: config.etcd.crt_file.clone(),
            etcd_key_file: config.etcd.key_file.clone(),
            health_sidecar: generation.health_sidecar,
        };

        let handlers = vec![
            wrap(ClusterRoleBindingResource::new(&config.clients), config, &metrics)?,
            wrap(NetworkConfigResource::new(config.store.clone()), config, &metrics)?,
            wrap(NamespaceResource::new(&config.clients), config, &metrics)?,
            wrap(LegacyResource::new(&config.clients, config.teardown.clone())?, config, &metrics)?,
            wrap(
                FlanneldResource::new(&config.clients, flanneld_config)?
                    .with_version_gauge(version_gauge.clone()),
                config,
                &metrics,
            )?,
        ];

        let set = ResourceSet::new(generation.version, handlers)?;
        info!(version = set.version(), handlers = ?set.handler_names(), "已创建资源集合");
        sets.push(set);
    }

    let router = ResourceRouter::new(sets)?.with_default(VERSION_0_1_0)?;
    Ok(vec![router])
}

fn wrap<R>(
    inner: R,
    config: &ResourceSetConfig,
    metrics: &ResourceMetrics,
) -> Result<Arc<dyn Handler<FlannelConfig>>>
where
    R: Resource<FlannelConfig> + 'static,
{
    let retry = RetryResource::new(inner, config.retry.clone())?;
    Ok(Arc::new(MetricsResource::new(retry, metrics.clone())))
}
