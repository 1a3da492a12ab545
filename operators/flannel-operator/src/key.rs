//! 资源命名
//!
//! 所有生成的资源名都是集群标识的纯函数，重复协调时必须保持完全一致。

use std::collections::BTreeMap;

use flannel_common::{Error, Result};

use crate::crd::FlannelConfig;

/// flannel 组件使用的应用标签，也是 DaemonSet 名称
pub const NETWORK_ID: &str = "flannel-network";

/// 清理任务使用的应用标签，也是 Job 名称
pub const DESTROYER_APP: &str = "flannel-destroyer";

/// DaemonSet 上记录版本包版本的注解
pub const VERSION_BUNDLE_VERSION_ANNOTATION: &str = "giantswarm.io/version-bundle-version";

/// 网络配置在配置存储中的根前缀
pub const ETCD_NETWORK_ROOT: &str = "coreos.com/network";

/// 存活探针端口基数
pub const PROBE_PORT_BASE: u32 = 21000;

/// VXLAN 网络标识上限（24 位）
pub const MAX_VNI: u32 = 16_777_215;

/// 存活探针地址
pub const PROBE_HOST: &str = "127.0.0.1";

pub fn cluster_id(obj: &FlannelConfig) -> &str {
    &obj.spec.cluster.id
}

pub fn cluster_customer(obj: &FlannelConfig) -> &str {
    &obj.spec.cluster.customer
}

pub fn cluster_namespace(obj: &FlannelConfig) -> &str {
    &obj.spec.cluster.namespace
}

pub fn flannel_run_dir(obj: &FlannelConfig) -> &str {
    &obj.spec.flannel.spec.run_dir
}

pub fn flannel_vni(obj: &FlannelConfig) -> u32 {
    obj.spec.flannel.spec.vni
}

pub fn host_private_network(obj: &FlannelConfig) -> &str {
    &obj.spec.bridge.spec.private_network
}

pub fn network_interface_name(obj: &FlannelConfig) -> &str {
    &obj.spec.bridge.spec.interface
}

pub fn network_bridge_image(obj: &FlannelConfig) -> &str {
    &obj.spec.bridge.docker.image
}

pub fn network_health_image(obj: &FlannelConfig) -> &str {
    &obj.spec.health.docker.image
}

pub fn version_bundle_version(obj: &FlannelConfig) -> &str {
    &obj.spec.version_bundle.version
}

/// flannel 网络命名空间：`flannel-network-<集群标识>`
pub fn network_namespace(obj: &FlannelConfig) -> String {
    format!("{}-{}", NETWORK_ID, cluster_id(obj))
}

/// 清理任务命名空间：`flannel-destroyer-<集群标识>`
pub fn destroyer_namespace(obj: &FlannelConfig) -> String {
    format!("{}-{}", DESTROYER_APP, cluster_id(obj))
}

/// 网桥名：`br-<集群标识>`
pub fn network_bridge_name(obj: &FlannelConfig) -> String {
    format!("br-{}", cluster_id(obj))
}

/// tap 设备名：`tap-<集群标识>`
pub fn network_tap_name(obj: &FlannelConfig) -> String {
    format!("tap-{}", cluster_id(obj))
}

/// vxlan 设备名：`flannel.<VNI>`
pub fn network_flannel_device(obj: &FlannelConfig) -> String {
    format!("flannel.{}", flannel_vni(obj))
}

/// 网桥环境文件路径
pub fn network_env_file_path(obj: &FlannelConfig) -> String {
    format!(
        "{}/networks/{}.env",
        flannel_run_dir(obj),
        network_bridge_name(obj)
    )
}

/// 网络根路径：`coreos.com/network/<网桥名>`
pub fn etcd_network_path(obj: &FlannelConfig) -> String {
    format!("{}/{}", ETCD_NETWORK_ROOT, network_bridge_name(obj))
}

/// 网络配置路径：`coreos.com/network/<网桥名>/config`
pub fn etcd_network_config_path(obj: &FlannelConfig) -> String {
    format!("{}/config", etcd_network_path(obj))
}

/// flanneld 使用的 etcd 前缀
pub fn etcd_prefix(obj: &FlannelConfig) -> String {
    format!("/{}", etcd_network_path(obj))
}

/// DNS 配置块，每行一个 `DNS=<服务器>`
pub fn network_dns_block(obj: &FlannelConfig) -> String {
    servers_block("DNS", &obj.spec.bridge.spec.dns.servers)
}

/// NTP 配置块，每行一个 `NTP=<服务器>`
pub fn network_ntp_block(obj: &FlannelConfig) -> String {
    servers_block("NTP", &obj.spec.bridge.spec.ntp.servers)
}

fn servers_block(prefix: &str, servers: &[String]) -> String {
    servers
        .iter()
        .map(|s| format!("{prefix}={s}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// flannel 与清理任务共用的服务账号名
pub fn service_account_name(obj: &FlannelConfig) -> String {
    cluster_id(obj).to_string()
}

/// VNI 对应的探针端口，超出 VNI 范围或端口范围时返回 `InvalidConfig`
pub fn probe_port(vni: u32) -> Result<u16> {
    if vni == 0 || vni > MAX_VNI {
        return Err(Error::InvalidConfig(format!("VNI {vni} 超出范围 1..={MAX_VNI}")));
    }
    PROBE_PORT_BASE
        .checked_add(vni)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| Error::InvalidConfig(format!("VNI {vni} 对应的探针端口超过 {}", u16::MAX)))
}

/// 存活探针端口：`21000 + VNI`
pub fn liveness_probe_port(obj: &FlannelConfig) -> Result<i32> {
    probe_port(flannel_vni(obj)).map(i32::from)
}

/// 健康检查容器监听地址
pub fn health_listen_address(obj: &FlannelConfig) -> Result<String> {
    Ok(format!("http://{}:{}", PROBE_HOST, liveness_probe_port(obj)?))
}

pub fn cluster_role_binding_name(obj: &FlannelConfig) -> String {
    format!("{}-{}", NETWORK_ID, cluster_id(obj))
}

pub fn cluster_role_binding_psp_name(obj: &FlannelConfig) -> String {
    format!("{}-{}-psp", NETWORK_ID, cluster_id(obj))
}

pub fn cluster_role_binding_deletion_name(obj: &FlannelConfig) -> String {
    format!("{}-deletion", cluster_id(obj))
}

pub fn cluster_role_binding_deletion_psp_name(obj: &FlannelConfig) -> String {
    format!("{}-{}-deletion-psp", NETWORK_ID, cluster_id(obj))
}

/// 命名空间与 RBAC 资源的标签
pub fn cluster_labels(obj: &FlannelConfig, app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        ("giantswarm.io/cluster".to_string(), cluster_id(obj).to_string()),
        ("giantswarm.io/organization".to_string(), cluster_customer(obj).to_string()),
        ("cluster-id".to_string(), cluster_id(obj).to_string()),
        ("customer-id".to_string(), cluster_customer(obj).to_string()),
    ])
}

/// 工作负载的标签
pub fn workload_labels(obj: &FlannelConfig, app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), app.to_string()),
        ("cluster".to_string(), cluster_id(obj).to_string()),
        ("customer".to_string(), cluster_customer(obj).to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::create_example_flannel_config;
    use rstest::rstest;

    #[rstest]
    #[case::smallest(1, Some(21001))]
    #[case::highest_usable_port(44_535, Some(65_535))]
    #[case::port_overflow(44_536, None)]
    #[case::largest_vni(MAX_VNI, None)]
    #[case::zero(0, None)]
    #[case::beyond_24_bits(u32::MAX, None)]
    fn test_probe_port(#[case] vni: u32, #[case] expected: Option<u16>) {
        match expected {
            Some(port) => assert_eq!(probe_port(vni).unwrap(), port),
            None => assert!(!probe_port(vni).unwrap_err().is_retryable()),
        }
    }

    #[test]
    fn test_names_derive_from_cluster_id() {
        let obj = create_example_flannel_config("xa5ly");

        assert_eq!(network_namespace(&obj), "flannel-network-xa5ly");
        assert_eq!(destroyer_namespace(&obj), "flannel-destroyer-xa5ly");
        assert_eq!(network_bridge_name(&obj), "br-xa5ly");
        assert_eq!(network_tap_name(&obj), "tap-xa5ly");
        assert_eq!(network_flannel_device(&obj), "flannel.26");
        assert_eq!(etcd_network_path(&obj), "coreos.com/network/br-xa5ly");
        assert_eq!(etcd_network_config_path(&obj), "coreos.com/network/br-xa5ly/config");
        assert_eq!(etcd_prefix(&obj), "/coreos.com/network/br-xa5ly");
        assert_eq!(network_env_file_path(&obj), "/run/flannel/networks/br-xa5ly.env");
        assert_eq!(liveness_probe_port(&obj).unwrap(), 21026);
        assert_eq!(health_listen_address(&obj).unwrap(), "http://127.0.0.1:21026");
        assert_eq!(service_account_name(&obj), "xa5ly");
    }

    #[test]
    fn test_names_are_stable() {
        let a = create_example_flannel_config("p1");
        let b = create_example_flannel_config("p1");
        assert_eq!(network_namespace(&a), network_namespace(&b));
        assert_eq!(etcd_network_config_path(&a), etcd_network_config_path(&b));
        assert_eq!(cluster_role_binding_name(&a), "flannel-network-p1");
        assert_eq!(cluster_role_binding_psp_name(&a), "flannel-network-p1-psp");
        assert_eq!(cluster_role_binding_deletion_name(&a), "p1-deletion");
        assert_eq!(cluster_role_binding_deletion_psp_name(&a), "flannel-network-p1-deletion-psp");
    }

    #[test]
    fn test_server_blocks() {
        let mut obj = create_example_flannel_config("xa5ly");
        assert_eq!(network_dns_block(&obj), "DNS=8.8.8.8\nDNS=8.8.4.4");
        assert_eq!(network_ntp_block(&obj), "NTP=0.coreos.pool.ntp.org");

        obj.spec.bridge.spec.dns.servers.clear();
        assert_eq!(network_dns_block(&obj), "");
    }
}
