//! 自定义资源定义模块
//!
//! 该模块定义 FlannelConfig 自定义资源。每个对象描述一个租户集群的 flannel 网络：
//! 集群标识、网桥配置、flannel 网络参数、健康检查镜像以及版本包版本。

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use flannel_common::{Error, Result};
use flannel_controller::ManagedObject;

/// FlannelConfig 规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "core.giantswarm.io", version = "v1alpha1", kind = "FlannelConfig", namespaced)]
#[kube(printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.cluster.id"}"#)]
#[kube(printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.versionBundle.version"}"#)]
#[serde(rename_all = "camelCase")]
pub struct FlannelConfigSpec {
    /// 租户集群信息
    pub cluster: ClusterSpec,

    /// 网桥配置
    pub bridge: BridgeSpec,

    /// flannel 网络配置
    pub flannel: FlannelSpec,

    /// 健康检查容器配置
    #[serde(default)]
    pub health: HealthSpec,

    /// 版本包
    #[serde(default)]
    pub version_bundle: VersionBundleSpec,
}

/// 租户集群信息
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterSpec {
    /// 集群标识，创建后不可变，所有生成的资源名都由它派生
    pub id: String,

    /// 客户/租户标签
    #[serde(default)]
    pub customer: String,

    /// 集群工作负载所在的命名空间
    #[serde(default)]
    pub namespace: String,
}

/// 网桥配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BridgeSpec {
    /// 网桥容器镜像
    pub docker: DockerSpec,

    /// 网桥网络参数
    pub spec: BridgeNetworkSpec,
}

/// 网桥网络参数
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgeNetworkSpec {
    /// 宿主机网卡名
    pub interface: String,

    /// 宿主机私有网络 CIDR
    pub private_network: String,

    /// DNS 服务器
    #[serde(default)]
    pub dns: ServersSpec,

    /// NTP 服务器
    #[serde(default)]
    pub ntp: ServersSpec,
}

/// 服务器列表
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServersSpec {
    #[serde(default)]
    pub servers: Vec<String>,
}

/// 容器镜像
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DockerSpec {
    pub image: String,
}

/// flannel 配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct FlannelSpec {
    pub spec: FlannelNetworkSpec,
}

/// flannel 网络参数
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlannelNetworkSpec {
    /// 覆盖网络 CIDR
    pub network: String,

    /// 子网长度
    pub subnet_len: u32,

    /// 宿主机上的运行目录
    pub run_dir: String,

    /// VXLAN 网络标识
    pub vni: u32,
}

/// 健康检查容器配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct HealthSpec {
    #[serde(default)]
    pub docker: DockerSpec,
}

/// 版本包
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VersionBundleSpec {
    #[serde(default)]
    pub version: String,
}

impl FlannelConfigSpec {
    /// 校验生成资源所必需的字段
    pub fn validate(&self) -> Result<()> {
        if self.cluster.id.is_empty() {
            return Err(Error::InvalidConfig("spec.cluster.id 不能为空".into()));
        }
        if self.flannel.spec.network.is_empty() {
            return Err(Error::InvalidConfig("spec.flannel.spec.network 不能为空".into()));
        }
        if self.flannel.spec.run_dir.is_empty() {
            return Err(Error::InvalidConfig("spec.flannel.spec.runDir 不能为空".into()));
        }
        // 探针端口由 VNI 推导，必须落在合法端口范围内
        crate::key::probe_port(self.flannel.spec.vni)?;
        Ok(())
    }
}

impl ManagedObject for FlannelConfig {
    fn object_key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_else(|| "default".into()),
            self.name_any()
        )
    }

    fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    fn version_bundle_version(&self) -> String {
        self.spec.version_bundle.version.clone()
    }
}

/// 创建测试与示例使用的 FlannelConfig
pub fn create_example_flannel_config(cluster_id: &str) -> FlannelConfig {
    let mut config = FlannelConfig::new(
        cluster_id,
        FlannelConfigSpec {
            cluster: ClusterSpec {
                id: cluster_id.to_string(),
                customer: "acme".to_string(),
                namespace: cluster_id.to_string(),
            },
            bridge: BridgeSpec {
                docker: DockerSpec {
                    image: "quay.io/giantswarm/k8s-network-bridge:latest".to_string(),
                },
                spec: BridgeNetworkSpec {
                    interface: "bond0.3".to_string(),
                    private_network: "10.0.4.0/24".to_string(),
                    dns: ServersSpec {
                        servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
                    },
                    ntp: ServersSpec {
                        servers: vec!["0.coreos.pool.ntp.org".to_string()],
                    },
                },
            },
            flannel: FlannelSpec {
                spec: FlannelNetworkSpec {
                    network: "172.26.0.0/16".to_string(),
                    subnet_len: 30,
                    run_dir: "/run/flannel".to_string(),
                    vni: 26,
                },
            },
            health: HealthSpec {
                docker: DockerSpec {
                    image: "quay.io/giantswarm/k8s-health:latest".to_string(),
                },
            },
            version_bundle: VersionBundleSpec {
                version: "0.2.0".to_string(),
            },
        },
    );
    config.metadata.namespace = Some("default".to_string());
    config
}
