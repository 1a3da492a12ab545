//! 子资源处理器
//!
//! 每个处理器负责 FlannelConfig 的一个方面：RBAC 绑定、etcd 网络配置、网络命名空间、
//! 服务账号与清理任务、flanneld DaemonSet。这里同时放置它们共用的清单构造函数。

pub mod cluster_role_bindings;
pub mod flanneld;
pub mod legacy;
pub mod namespace;
pub mod network_config;

pub use cluster_role_bindings::ClusterRoleBindingResource;
pub use flanneld::{FlanneldConfig, FlanneldResource};
pub use legacy::LegacyResource;
pub use namespace::NamespaceResource;
pub use network_config::NetworkConfigResource;

use k8s_openapi::api::core::v1::{
    EnvVar, HostPathVolumeSource, Namespace, SecurityContext, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;

use crate::crd::FlannelConfig;
use crate::key;

/// flannel 使用的集群角色
pub const CLUSTER_ROLE: &str = "flannel-operator";

/// flannel 使用的 PSP 集群角色
pub const CLUSTER_ROLE_PSP: &str = "flannel-operator-psp";

/// 命名空间终止中的阶段名
const NAMESPACE_TERMINATING: &str = "Terminating";

/// 命名空间是否正在终止
pub(crate) fn is_terminating(namespace: &Namespace) -> bool {
    namespace.metadata.deletion_timestamp.is_some()
        || namespace
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some(NAMESPACE_TERMINATING)
}

/// 带集群标签的命名空间
pub(crate) fn new_namespace(obj: &FlannelConfig, name: &str, app: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(key::cluster_labels(obj, app)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 集群的服务账号
pub(crate) fn new_service_account(obj: &FlannelConfig, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(key::service_account_name(obj)),
            namespace: Some(namespace.to_string()),
            labels: Some(key::cluster_labels(obj, key::NETWORK_ID)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 将集群服务账号绑定到集群角色
pub(crate) fn new_cluster_role_binding(
    obj: &FlannelConfig,
    name: &str,
    subject_namespace: &str,
    role: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(key::cluster_labels(obj, key::NETWORK_ID)),
            ..Default::default()
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: key::service_account_name(obj),
            namespace: Some(subject_namespace.to_string()),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
    }
}

pub(crate) fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// 网桥容器读取的环境变量
pub(crate) fn bridge_env(obj: &FlannelConfig) -> Vec<EnvVar> {
    vec![
        env_var("HOST_PRIVATE_NETWORK", key::host_private_network(obj)),
        env_var("NETWORK_BRIDGE_NAME", key::network_bridge_name(obj)),
        env_var("NETWORK_DNS_BLOCK", key::network_dns_block(obj)),
        env_var("NETWORK_ENV_FILE_PATH", key::network_env_file_path(obj)),
        env_var("NETWORK_FLANNEL_DEVICE", key::network_flannel_device(obj)),
        env_var("NETWORK_INTERFACE_NAME", key::network_interface_name(obj)),
        env_var("NETWORK_NTP_BLOCK", key::network_ntp_block(obj)),
        env_var("NETWORK_TAP_NAME", key::network_tap_name(obj)),
    ]
}

pub(crate) fn privileged() -> Option<SecurityContext> {
    Some(SecurityContext {
        privileged: Some(true),
        ..Default::default()
    })
}

pub(crate) fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// 网桥容器与清理任务共用的宿主机目录
pub(crate) fn bridge_volume_mounts() -> Vec<VolumeMount> {
    vec![
        volume_mount("cgroup", "/sys/fs/cgroup"),
        volume_mount("dbus", "/var/run/dbus"),
        volume_mount("environment", "/etc/environment"),
        volume_mount("etc-systemd", "/etc/systemd/"),
        volume_mount("flannel", "/run/flannel"),
        volume_mount("systemd", "/run/systemd"),
        volume_mount("sys-class-net", "/sys/class/net/"),
    ]
}

/// DaemonSet 与清理任务共用的宿主机卷
pub(crate) fn host_volumes(obj: &FlannelConfig) -> Vec<Volume> {
    vec![
        host_path_volume("cgroup", "/sys/fs/cgroup"),
        host_path_volume("dbus", "/var/run/dbus"),
        host_path_volume("environment", "/etc/environment"),
        host_path_volume("etcd-certs", "/etc/kubernetes/ssl/etcd"),
        host_path_volume("etc-systemd", "/etc/systemd/"),
        host_path_volume("flannel", key::flannel_run_dir(obj)),
        host_path_volume("ssl", "/etc/ssl/certs"),
        host_path_volume("systemd", "/run/systemd"),
        host_path_volume("sys-class-net", "/sys/class/net/"),
    ]
}
