//! flanneld DaemonSet 处理器
//!
//! 在网络命名空间中运行 flanneld、网桥容器以及（可选的）健康检查容器。
//! 对象自己的 DaemonSet 已由更新的版本包接管时旧一代让出，删除时等待集群命名空间中的
//! 工作负载全部退出。

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, RollingUpdateDaemonSet,
};
use k8s_openapi::api::core::v1::{
    Container, HTTPGetAction, Pod, PodSpec, PodTemplateSpec, Probe,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use prometheus::{GaugeVec, Opts, Registry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use flannel_common::{Error, Result, SemVer};
use flannel_controller::{Flow, ManagedObject, Patch, Resource};

use super::{bridge_env, bridge_volume_mounts, env_var, host_volumes, privileged, volume_mount};
use crate::cluster::{create_if_missing, delete_if_exists, ClusterClients, ObjectApi};
use crate::crd::FlannelConfig;
use crate::key;

/// 处理器名称
pub const NAME: &str = "flanneld";

/// flanneld 镜像仓库
pub const FLANNEL_IMAGE_REPOSITORY: &str = "quay.io/giantswarm/flannel";

/// 节点本地的 etcd 端点
pub const LOCAL_ETCD_ENDPOINT: &str = "https://127.0.0.1:2379";

const HEALTH_ENDPOINT: &str = "/healthz";

/// flanneld 处理器配置
#[derive(Debug, Clone, PartialEq)]
pub struct FlanneldConfig {
    /// 写入 DaemonSet 注解的版本包版本
    pub version_bundle: String,
    /// flanneld 镜像
    pub image: String,
    /// flanneld 连接的 etcd 端点
    pub etcd_endpoints: Vec<String>,
    /// 节点上的 etcd 证书路径
    pub etcd_ca_file: String,
    pub etcd_crt_file: String,
    pub etcd_key_file: String,
    /// 是否运行健康检查容器
    pub health_sidecar: bool,
}

impl FlanneldConfig {
    pub fn validate(&self) -> Result<()> {
        SemVer::parse(&self.version_bundle)?;
        if self.image.is_empty() {
            return Err(Error::InvalidConfig("flanneld 镜像不能为空".into()));
        }
        if self.etcd_endpoints.is_empty() {
            return Err(Error::InvalidConfig("flanneld etcd 端点不能为空".into()));
        }
        for (field, value) in [
            ("etcd_ca_file", &self.etcd_ca_file),
            ("etcd_crt_file", &self.etcd_crt_file),
            ("etcd_key_file", &self.etcd_key_file),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidConfig(format!("flanneld {field} 不能为空")));
            }
        }
        Ok(())
    }
}

/// flannel 版本对应的 flanneld 镜像
pub fn flannel_image(flannel_version: &str) -> String {
    format!("{FLANNEL_IMAGE_REPOSITORY}:v{flannel_version}-amd64")
}

/// 创建并注册版本包版本指标
pub fn new_version_gauge(registry: &Registry) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(
        Opts::new(
            "flannel_operator_version_bundle_version",
            "Version bundle version of the running flanneld daemon sets",
        ),
        &["major", "minor", "patch"],
    )
    .map_err(|e| Error::InvalidConfig(format!("创建版本指标失败: {e}")))?;
    registry
        .register(Box::new(gauge.clone()))
        .map_err(|e| Error::InvalidConfig(format!("注册版本指标失败: {e}")))?;
    Ok(gauge)
}

/// flanneld DaemonSet 处理器
pub struct FlanneldResource {
    daemon_sets: Arc<dyn ObjectApi<DaemonSet>>,
    pods: Arc<dyn ObjectApi<Pod>>,
    config: FlanneldConfig,
    version: SemVer,
    version_gauge: Option<GaugeVec>,
}

impl FlanneldResource {
    pub fn new(clients: &ClusterClients, config: FlanneldConfig) -> Result<Self> {
        config.validate()?;
        let version = SemVer::parse(&config.version_bundle)?;
        Ok(Self {
            daemon_sets: clients.daemon_sets.clone(),
            pods: clients.pods.clone(),
            config,
            version,
            version_gauge: None,
        })
    }

    pub fn with_version_gauge(mut self, gauge: GaugeVec) -> Self {
        self.version_gauge = Some(gauge);
        self
    }

    /// 当前 DaemonSet 由更新的版本包写入时返回该版本
    fn newer_generation<'a>(&self, current: &'a DaemonSet) -> Option<&'a str> {
        let version = version_annotation(current)?;
        match SemVer::parse(version) {
            Ok(v) if v > self.version => Some(version.as_str()),
            _ => None,
        }
    }

    fn update_version_gauge(&self, obj: &FlannelConfig, daemon_set: &DaemonSet) {
        let Some(gauge) = &self.version_gauge else {
            return;
        };

        let version = daemon_set
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key::VERSION_BUNDLE_VERSION_ANNOTATION));
        let Some(version) = version else {
            warn!(cluster = key::cluster_id(obj), "DaemonSet 缺少版本注解，无法更新版本指标");
            return;
        };

        match SemVer::parse(version) {
            Ok(v) => {
                let (major, minor, patch) = (v.major.to_string(), v.minor.to_string(), v.patch.to_string());
                gauge.with_label_values(&[major.as_str(), minor.as_str(), patch.as_str()]).set(1.0);
            }
            Err(e) => warn!(cluster = key::cluster_id(obj), "无法更新版本指标: {}", e),
        }
    }

    fn flanneld_container(&self, obj: &FlannelConfig) -> Result<Container> {
        let command = format!(
            "/opt/bin/flanneld --etcd-endpoints={} --etcd-cafile=${{ETCD_CA}} --etcd-certfile=${{ETCD_CRT}} --etcd-keyfile=${{ETCD_KEY}} --etcd-prefix=${{ETCD_PREFIX}} --iface=${{NETWORK_INTERFACE_NAME}} --subnet-file=${{NETWORK_ENV_FILE_PATH}} -v=0",
            self.config.etcd_endpoints.join(",")
        );

        Ok(Container {
            name: "flanneld".to_string(),
            image: Some(self.config.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), command]),
            env: Some(vec![
                env_var("ETCD_CA", &self.config.etcd_ca_file),
                env_var("ETCD_CRT", &self.config.etcd_crt_file),
                env_var("ETCD_KEY", &self.config.etcd_key_file),
                env_var("ETCD_PREFIX", key::etcd_prefix(obj)),
                env_var("NETWORK_BRIDGE_NAME", key::network_bridge_name(obj)),
                env_var("NETWORK_ENV_FILE_PATH", key::network_env_file_path(obj)),
                env_var("NETWORK_INTERFACE_NAME", key::network_interface_name(obj)),
            ]),
            liveness_probe: Some(liveness_probe(obj)?),
            volume_mounts: Some(vec![
                volume_mount("etcd-certs", "/etc/kubernetes/ssl/etcd"),
                volume_mount("flannel", "/run/flannel"),
                volume_mount("ssl", "/etc/ssl/certs"),
            ]),
            security_context: privileged(),
            ..Default::default()
        })
    }

    /// 期望的 DaemonSet
    pub(crate) fn new_daemon_set(&self, obj: &FlannelConfig) -> Result<DaemonSet> {
        let labels = key::workload_labels(obj, key::NETWORK_ID);
        let selector = BTreeMap::from([
            ("app".to_string(), key::NETWORK_ID.to_string()),
            ("cluster".to_string(), key::cluster_id(obj).to_string()),
        ]);

        let mut containers = vec![self.flanneld_container(obj)?, bridge_container(obj)?];
        if self.config.health_sidecar {
            containers.push(health_container(obj)?);
        }

        Ok(DaemonSet {
            metadata: ObjectMeta {
                name: Some(key::NETWORK_ID.to_string()),
                namespace: Some(key::network_namespace(obj)),
                annotations: Some(BTreeMap::from([(
                    key::VERSION_BUNDLE_VERSION_ANNOTATION.to_string(),
                    self.config.version_bundle.clone(),
                )])),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        generate_name: Some(key::NETWORK_ID.to_string()),
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        host_network: Some(true),
                        service_account_name: Some(key::service_account_name(obj)),
                        containers,
                        volumes: Some(host_volumes(obj)),
                        ..Default::default()
                    }),
                },
                update_strategy: Some(DaemonSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    // 每次只更新一个节点
                    rolling_update: Some(RollingUpdateDaemonSet {
                        max_unavailable: Some(IntOrString::Int(1)),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

fn liveness_probe(obj: &FlannelConfig) -> Result<Probe> {
    Ok(Probe {
        initial_delay_seconds: Some(10),
        timeout_seconds: Some(5),
        period_seconds: Some(10),
        failure_threshold: Some(2),
        success_threshold: Some(1),
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_ENDPOINT.to_string()),
            port: IntOrString::Int(key::liveness_probe_port(obj)?),
            host: Some(key::PROBE_HOST.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn bridge_container(obj: &FlannelConfig) -> Result<Container> {
    Ok(Container {
        name: "k8s-network-bridge".to_string(),
        image: Some(key::network_bridge_image(obj).to_string()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "while [ ! -f ${NETWORK_ENV_FILE_PATH} ]; do echo \"Waiting for ${NETWORK_ENV_FILE_PATH} to be created\"; sleep 1; done; /docker-entrypoint.sh create ${NETWORK_ENV_FILE_PATH} ${NETWORK_BRIDGE_NAME} ${NETWORK_INTERFACE_NAME} ${HOST_PRIVATE_NETWORK}".to_string(),
        ]),
        env: Some(bridge_env(obj)),
        liveness_probe: Some(liveness_probe(obj)?),
        security_context: privileged(),
        volume_mounts: Some(bridge_volume_mounts()),
        ..Default::default()
    })
}

fn health_container(obj: &FlannelConfig) -> Result<Container> {
    Ok(Container {
        name: "flannel-network-health".to_string(),
        image: Some(key::network_health_image(obj).to_string()),
        image_pull_policy: Some("Always".to_string()),
        env: Some(vec![
            env_var("LISTEN_ADDRESS", key::health_listen_address(obj)?),
            env_var("NETWORK_BRIDGE_NAME", key::network_bridge_name(obj)),
            env_var("NETWORK_ENV_FILE_PATH", key::network_env_file_path(obj)),
            env_var("NETWORK_FLANNEL_DEVICE", key::network_flannel_device(obj)),
        ]),
        security_context: privileged(),
        volume_mounts: Some(vec![volume_mount("flannel", "/run/flannel")]),
        ..Default::default()
    })
}

fn version_annotation(ds: &DaemonSet) -> Option<&String> {
    ds.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key::VERSION_BUNDLE_VERSION_ANNOTATION))
}

/// 比较容器的名称、镜像、命令与环境变量
///
/// API Server 会为模板补充默认字段，不能直接比较整个模板。
fn containers_differ(current: &DaemonSet, desired: &DaemonSet) -> bool {
    let fingerprint = |ds: &DaemonSet| {
        ds.spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| {
                p.containers
                    .iter()
                    .map(|c| (c.name.clone(), c.image.clone(), c.command.clone(), c.env.clone()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };
    fingerprint(current) != fingerprint(desired)
}

fn needs_update(current: &DaemonSet, desired: &DaemonSet) -> bool {
    version_annotation(current) != version_annotation(desired) || containers_differ(current, desired)
}

#[async_trait]
impl Resource<FlannelConfig> for FlanneldResource {
    type State = Option<DaemonSet>;

    fn name(&self) -> &str {
        NAME
    }

    async fn get_current_state(&self, obj: &FlannelConfig) -> Result<Flow<Self::State>> {
        let cluster = key::cluster_id(obj);

        if obj.is_deleted() {
            let namespace = key::cluster_namespace(obj);
            if !namespace.is_empty() {
                let pods = self.pods.list(Some(namespace), None).await?;
                if !pods.is_empty() {
                    info!(cluster, pods = pods.len(), "集群命名空间中仍有容器，暂不删除网络");
                    return Ok(Flow::KeepFinalizer);
                }
            }
        }

        let current = self
            .daemon_sets
            .get(Some(&key::network_namespace(obj)), key::NETWORK_ID)
            .await?;
        match &current {
            Some(ds) => {
                debug!(cluster, "找到 DaemonSet");
                self.update_version_gauge(obj, ds);

                if !obj.is_deleted() {
                    if let Some(newer) = self.newer_generation(ds) {
                        info!(cluster, current = newer, own = %self.config.version_bundle, "DaemonSet 已由更新的版本包管理，取消本轮协调");
                        return Ok(Flow::Cancel);
                    }
                }
            }
            None => debug!(cluster, "未找到 DaemonSet"),
        }

        Ok(Flow::Continue(current))
    }

    async fn get_desired_state(&self, obj: &FlannelConfig) -> Result<Self::State> {
        // 删除只依赖当前状态，规范可能已无效
        if obj.is_deleted() {
            return Ok(None);
        }
        Ok(Some(self.new_daemon_set(obj)?))
    }

    fn new_update_patch(
        &self,
        _obj: &FlannelConfig,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        let mut patch = Patch::new();
        match (current, desired) {
            (None, Some(_)) => patch.set_create_change(desired.clone()),
            (Some(c), Some(d)) if needs_update(c, d) => patch.set_update_change(desired.clone()),
            _ => {}
        }
        Ok(patch)
    }

    async fn apply_create_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        if let Some(ds) = state {
            let namespace = key::network_namespace(obj);
            if create_if_missing(self.daemon_sets.as_ref(), Some(&namespace), ds).await? {
                info!(cluster = key::cluster_id(obj), "已创建 DaemonSet");
            }
        }
        Ok(Flow::proceed())
    }

    async fn apply_update_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        let Some(desired) = state else {
            return Ok(Flow::proceed());
        };
        let namespace = key::network_namespace(obj);

        // 带上当前 resourceVersion，由 API Server 检测并发修改
        let Some(existing) = self.daemon_sets.get(Some(&namespace), key::NETWORK_ID).await? else {
            create_if_missing(self.daemon_sets.as_ref(), Some(&namespace), desired).await?;
            return Ok(Flow::proceed());
        };
        let mut ds = desired.clone();
        ds.metadata.resource_version = existing.metadata.resource_version;
        self.daemon_sets.replace(Some(&namespace), &ds).await?;
        info!(cluster = key::cluster_id(obj), version = %self.config.version_bundle, "已更新 DaemonSet");

        Ok(Flow::proceed())
    }

    async fn apply_delete_change(&self, obj: &FlannelConfig, _state: &Self::State) -> Result<Flow<()>> {
        let namespace = key::network_namespace(obj);
        if delete_if_exists(self.daemon_sets.as_ref(), Some(&namespace), key::NETWORK_ID).await? {
            info!(cluster = key::cluster_id(obj), "已删除 DaemonSet");
        }
        Ok(Flow::proceed())
    }
}
