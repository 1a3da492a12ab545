//! 服务账号与清理处理器
//!
//! 创建时为 flanneld 创建服务账号。删除时无论服务账号是否存在，都在每个可调度节点上
//! 运行一次清理任务，移除宿主机上的网桥与 flannel 设备，完成后清理任务相关的资源，
//! 最后删除服务账号。

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::api::ObjectMeta;
use tracing::{debug, info, warn};

use flannel_common::{Error, Result};
use flannel_controller::{retry_operation, BackoffPolicy, Flow, Patch, Resource};

use super::{
    bridge_env, bridge_volume_mounts, host_volumes, is_terminating, new_cluster_role_binding,
    new_namespace, new_service_account, privileged, CLUSTER_ROLE, CLUSTER_ROLE_PSP,
};
use crate::cluster::{create_if_missing, delete_if_exists, ClusterClients, ObjectApi};
use crate::crd::FlannelConfig;
use crate::key;

/// 处理器名称
pub const NAME: &str = "legacy";

/// 服务账号与清理处理器
pub struct LegacyResource {
    clients: ClusterClients,
    /// 等待清理任务完成的退避策略
    teardown: BackoffPolicy,
}

impl LegacyResource {
    pub fn new(clients: &ClusterClients, teardown: BackoffPolicy) -> Result<Self> {
        teardown.validate()?;
        Ok(Self {
            clients: clients.clone(),
            teardown,
        })
    }

    /// 执行删除流程
    async fn teardown(&self, obj: &FlannelConfig) -> Result<Flow<()>> {
        let cluster = key::cluster_id(obj);

        // flanneld 仍在运行时无法清理宿主机网络
        let network_namespace = key::network_namespace(obj);
        let selector = format!("app={}", key::NETWORK_ID);
        let pods = self.clients.pods.list(Some(&network_namespace), Some(&selector)).await?;
        if !pods.is_empty() {
            info!(cluster, pods = pods.len(), "flannel 容器仍在运行，保留 finalizer");
            return Ok(Flow::KeepFinalizer);
        }

        let destroyer_namespace = key::destroyer_namespace(obj);
        match self.clients.namespaces.get(None, &destroyer_namespace).await? {
            Some(ns) if is_terminating(&ns) => {
                info!(cluster, namespace = %destroyer_namespace, "清理命名空间正在终止，保留 finalizer");
                return Ok(Flow::KeepFinalizer);
            }
            Some(_) => debug!(cluster, namespace = %destroyer_namespace, "清理命名空间已存在"),
            None => {
                let ns = new_namespace(obj, &destroyer_namespace, key::DESTROYER_APP);
                create_if_missing(self.clients.namespaces.as_ref(), None, &ns).await?;
                debug!(cluster, namespace = %destroyer_namespace, "已创建清理命名空间");
            }
        }

        for binding in deletion_bindings(obj) {
            create_if_missing(self.clients.cluster_role_bindings.as_ref(), None, &binding).await?;
        }
        let account = new_service_account(obj, &destroyer_namespace);
        create_if_missing(self.clients.service_accounts.as_ref(), Some(&destroyer_namespace), &account).await?;

        match self.clients.jobs.get(Some(&destroyer_namespace), key::DESTROYER_APP).await? {
            Some(job) => {
                let (succeeded, replicas) = job_progress(&job);
                if succeeded != replicas {
                    info!(cluster, succeeded, replicas, "清理任务尚未完成，保留 finalizer");
                    return Ok(Flow::KeepFinalizer);
                }
                debug!(cluster, replicas, "清理任务已完成");
            }
            None => {
                let replicas = self.schedulable_nodes().await?;
                if replicas == 0 {
                    warn!(cluster, "没有可调度节点，跳过网桥清理");
                } else {
                    let job = new_job(obj, replicas);
                    create_if_missing(self.clients.jobs.as_ref(), Some(&destroyer_namespace), &job).await?;
                    info!(cluster, replicas, "已在 {} 个节点上调度网桥清理", replicas);

                    self.wait_for_job(obj, replicas).await?;
                }
            }
        }

        self.remove_cleanup_resources(obj).await?;
        Ok(Flow::proceed())
    }

    /// 统计可调度节点数
    async fn schedulable_nodes(&self) -> Result<i32> {
        let nodes = self.clients.nodes.list(None, None).await?;
        let schedulable = nodes
            .iter()
            .filter(|n| !n.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false))
            .count();
        Ok(schedulable as i32)
    }

    /// 按清理策略轮询，直到清理任务在所有节点上成功
    async fn wait_for_job(&self, obj: &FlannelConfig, replicas: i32) -> Result<()> {
        let cluster = key::cluster_id(obj);
        let namespace = key::destroyer_namespace(obj);

        retry_operation(&self.teardown, NAME, "wait_for_job", || {
            let jobs = self.clients.jobs.clone();
            let namespace = namespace.clone();
            async move {
                let job = jobs
                    .get(Some(&namespace), key::DESTROYER_APP)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("{namespace}/{}", key::DESTROYER_APP)))?;

                let (succeeded, _) = job_progress(&job);
                if succeeded != replicas {
                    return Err(Error::Timeout(format!("网桥清理进度 {succeeded}/{replicas}")));
                }
                Ok(())
            }
        })
        .await?;

        info!(cluster, replicas, "网桥清理已在全部节点完成");
        Ok(())
    }

    /// 删除清理命名空间、清理绑定和网络服务账号
    async fn remove_cleanup_resources(&self, obj: &FlannelConfig) -> Result<()> {
        let cluster = key::cluster_id(obj);

        delete_if_exists(self.clients.namespaces.as_ref(), None, &key::destroyer_namespace(obj)).await?;
        for name in [
            key::cluster_role_binding_deletion_name(obj),
            key::cluster_role_binding_deletion_psp_name(obj),
        ] {
            delete_if_exists(self.clients.cluster_role_bindings.as_ref(), None, &name).await?;
        }
        delete_if_exists(
            self.clients.service_accounts.as_ref(),
            Some(&key::network_namespace(obj)),
            &key::service_account_name(obj),
        )
        .await?;

        info!(cluster, "flannel 清理完成");
        Ok(())
    }
}

/// 清理任务的 (成功数, 期望数)
fn job_progress(job: &Job) -> (i32, i32) {
    let succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0);
    let replicas = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(1);
    (succeeded, replicas)
}

fn deletion_bindings(obj: &FlannelConfig) -> Vec<ClusterRoleBinding> {
    let namespace = key::destroyer_namespace(obj);
    vec![
        new_cluster_role_binding(obj, &key::cluster_role_binding_deletion_name(obj), &namespace, CLUSTER_ROLE),
        new_cluster_role_binding(obj, &key::cluster_role_binding_deletion_psp_name(obj), &namespace, CLUSTER_ROLE_PSP),
    ]
}

/// 每个节点只调度一个清理容器
fn destroyer_affinity(obj: &FlannelConfig) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: "app".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![key::DESTROYER_APP.to_string()]),
                    }]),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                namespaces: Some(vec![key::destroyer_namespace(obj)]),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// 网桥清理任务
pub(crate) fn new_job(obj: &FlannelConfig, replicas: i32) -> Job {
    let labels = key::workload_labels(obj, key::DESTROYER_APP);

    Job {
        metadata: ObjectMeta {
            name: Some(key::DESTROYER_APP.to_string()),
            namespace: Some(key::destroyer_namespace(obj)),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            parallelism: Some(replicas),
            completions: Some(replicas),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    generate_name: Some(key::DESTROYER_APP.to_string()),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(key::service_account_name(obj)),
                    restart_policy: Some("OnFailure".to_string()),
                    host_network: Some(true),
                    host_pid: Some(true),
                    affinity: Some(destroyer_affinity(obj)),
                    volumes: Some(host_volumes(obj)),
                    containers: vec![Container {
                        name: "k8s-network-bridge".to_string(),
                        image: Some(key::network_bridge_image(obj).to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            "/docker-entrypoint.sh delete ${NETWORK_ENV_FILE_PATH} ${NETWORK_BRIDGE_NAME} ${NETWORK_INTERFACE_NAME} ${HOST_PRIVATE_NETWORK}".to_string(),
                        ]),
                        env: Some(bridge_env(obj)),
                        security_context: privileged(),
                        volume_mounts: Some(bridge_volume_mounts()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Resource<FlannelConfig> for LegacyResource {
    type State = Option<ServiceAccount>;

    fn name(&self) -> &str {
        NAME
    }

    async fn get_current_state(&self, obj: &FlannelConfig) -> Result<Flow<Self::State>> {
        let current = self
            .clients
            .service_accounts
            .get(Some(&key::network_namespace(obj)), &key::service_account_name(obj))
            .await?;
        Ok(Flow::Continue(current))
    }

    async fn get_desired_state(&self, obj: &FlannelConfig) -> Result<Self::State> {
        Ok(Some(new_service_account(obj, &key::network_namespace(obj))))
    }

    fn new_update_patch(
        &self,
        _obj: &FlannelConfig,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        let mut patch = Patch::new();
        if current.is_none() && desired.is_some() {
            patch.set_create_change(desired.clone());
        }
        Ok(patch)
    }

    /// 宿主机上的网桥不体现在服务账号上，删除槽始终填充
    fn new_delete_patch(
        &self,
        _obj: &FlannelConfig,
        current: &Self::State,
        _desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        let mut patch = Patch::new();
        patch.set_delete_change(current.clone());
        Ok(patch)
    }

    async fn apply_create_change(&self, obj: &FlannelConfig, state: &Self::State) -> Result<Flow<()>> {
        if let Some(account) = state {
            let namespace = key::network_namespace(obj);
            if create_if_missing(self.clients.service_accounts.as_ref(), Some(&namespace), account).await? {
                info!(cluster = key::cluster_id(obj), namespace = %namespace, "已创建服务账号");
            }
        }
        Ok(Flow::proceed())
    }

    async fn apply_update_change(&self, _obj: &FlannelConfig, _state: &Self::State) -> Result<Flow<()>> {
        Ok(Flow::proceed())
    }

    async fn apply_delete_change(&self, obj: &FlannelConfig, _state: &Self::State) -> Result<Flow<()>> {
        self.teardown(obj).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::create_example_flannel_config;
    use flannel_controller::Handler;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn fast_policy(max_elapsed: Duration) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            multiplier: 1.5,
            max_elapsed_time: max_elapsed,
        }
    }

    fn node(name: &str, unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 四个节点，其中一个不可调度；网络服务账号已存在
    async fn seeded_clients(obj: &FlannelConfig) -> ClusterClients {
        let clients = ClusterClients::in_memory();
        for (name, unschedulable) in [("n1", false), ("n2", false), ("n3", true), ("n4", false)] {
            clients.nodes.create(None, &node(name, unschedulable)).await.unwrap();
        }
        let namespace = key::network_namespace(obj);
        clients
            .service_accounts
            .create(Some(&namespace), &new_service_account(obj, &namespace))
            .await
            .unwrap();
        clients
    }

    async fn complete_job_when_created(clients: ClusterClients, namespace: String, succeeded: i32) {
        loop {
            if let Some(mut job) = clients.jobs.get(Some(&namespace), key::DESTROYER_APP).await.unwrap() {
                job.status = Some(JobStatus {
                    succeeded: Some(succeeded),
                    ..Default::default()
                });
                job.metadata.resource_version = None;
                clients.jobs.replace(Some(&namespace), &job).await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_create_service_account() {
        let clients = ClusterClients::in_memory();
        let resource = LegacyResource::new(&clients, fast_policy(Duration::from_secs(1))).unwrap();
        let obj = create_example_flannel_config("abc12");

        resource.ensure_created(&obj).await.unwrap();
        assert!(clients
            .service_accounts
            .get(Some("flannel-network-abc12"), "abc12")
            .await
            .unwrap()
            .is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_teardown_sizes_job_by_schedulable_nodes() {
        let obj = create_example_flannel_config("abc12");
        let clients = seeded_clients(&obj).await;
        let resource = LegacyResource::new(&clients, fast_policy(Duration::from_secs(5))).unwrap();

        let completer = tokio::spawn(complete_job_when_created(
            clients.clone(),
            "flannel-destroyer-abc12".to_string(),
            3,
        ));

        assert_eq!(resource.ensure_deleted(&obj).await.unwrap(), Flow::proceed());
        completer.await.unwrap();

        let job = clients.jobs.get(Some("flannel-destroyer-abc12"), "flannel-destroyer").await.unwrap().unwrap();
        let spec = job.spec.unwrap();
        assert_eq!(spec.completions, Some(3));
        assert_eq!(spec.parallelism, Some(3));

        // 清理资源与网络服务账号都已删除
        assert!(clients.namespaces.get(None, "flannel-destroyer-abc12").await.unwrap().is_none());
        assert!(clients.cluster_role_bindings.list(None, None).await.unwrap().is_empty());
        assert!(clients
            .service_accounts
            .get(Some("flannel-network-abc12"), "abc12")
            .await
            .unwrap()
            .is_none());
    }

    #[test_log::test(tokio::test)]
    async fn test_teardown_runs_without_service_account() {
        let obj = create_example_flannel_config("abc12");
        let clients = ClusterClients::in_memory();
        for name in ["n1", "n2", "n3"] {
            clients.nodes.create(None, &node(name, false)).await.unwrap();
        }
        let resource = LegacyResource::new(&clients, fast_policy(Duration::from_secs(5))).unwrap();

        let completer = tokio::spawn(complete_job_when_created(
            clients.clone(),
            "flannel-destroyer-abc12".to_string(),
            3,
        ));

        assert_eq!(resource.ensure_deleted(&obj).await.unwrap(), Flow::proceed());
        completer.await.unwrap();

        let job = clients.jobs.get(Some("flannel-destroyer-abc12"), "flannel-destroyer").await.unwrap().unwrap();
        assert_eq!(job.spec.unwrap().completions, Some(3));
        assert!(clients.namespaces.get(None, "flannel-destroyer-abc12").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_progress_exhausts_teardown_budget() {
        let obj = create_example_flannel_config("abc12");
        let clients = seeded_clients(&obj).await;
        let resource = LegacyResource::new(&clients, fast_policy(Duration::from_millis(200))).unwrap();

        let completer = tokio::spawn(complete_job_when_created(
            clients.clone(),
            "flannel-destroyer-abc12".to_string(),
            2,
        ));

        let err = resource.ensure_deleted(&obj).await.unwrap_err();
        completer.await.unwrap();
        assert_eq!(err.resource_name(), Some(NAME));
        assert!(err.is_retryable());

        // 网络服务账号保留，下一轮继续清理
        assert!(clients
            .service_accounts
            .get(Some("flannel-network-abc12"), "abc12")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_existing_incomplete_job_keeps_finalizer() {
        let obj = create_example_flannel_config("abc12");
        let clients = seeded_clients(&obj).await;
        let resource = LegacyResource::new(&clients, fast_policy(Duration::from_secs(5))).unwrap();

        let mut job = new_job(&obj, 3);
        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        clients.jobs.create(Some("flannel-destroyer-abc12"), &job).await.unwrap();

        assert_eq!(resource.ensure_deleted(&obj).await.unwrap(), Flow::KeepFinalizer);
        assert_eq!(clients.jobs.list(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_running_flannel_pods_keep_finalizer() {
        let obj = create_example_flannel_config("abc12");
        let clients = seeded_clients(&obj).await;
        let resource = LegacyResource::new(&clients, fast_policy(Duration::from_secs(5))).unwrap();

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("flannel-network-x1".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "flannel-network".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        };
        clients.pods.create(Some("flannel-network-abc12"), &pod).await.unwrap();

        assert_eq!(resource.ensure_deleted(&obj).await.unwrap(), Flow::KeepFinalizer);
        assert!(clients.jobs.list(None, None).await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_teardown_policy() {
        let clients = ClusterClients::in_memory();
        let mut policy = fast_policy(Duration::from_secs(1));
        policy.initial_interval = Duration::ZERO;
        assert!(LegacyResource::new(&clients, policy).is_err());
    }
}
