//! 资源协调模块
//!
//! 该模块把控制器收到的 FlannelConfig 交给协调引擎，并负责 finalizer 的添加与移除：
//! 存活对象在第一轮协调前加上 finalizer，已删除对象只有在删除流程全部完成后才移除。

use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use flannel_controller::{Engine, ManagedObject, PassOutcome, ReconcileError};

use crate::cluster::ObjectApi;
use crate::config::ControllerConfig;
use crate::crd::FlannelConfig;
use crate::key;

/// Operator 添加到 FlannelConfig 上的 finalizer
pub const FINALIZER: &str = "flannel-operator.giantswarm.io/flannel-network";

/// 控制器回调返回的错误
#[derive(Error, Debug)]
pub enum OperatorError {
    /// 处理器失败
    #[error(transparent)]
    Pass(#[from] ReconcileError),

    /// 对象本身无效，或更新 finalizer 失败
    #[error(transparent)]
    Object(#[from] flannel_common::Error),
}

/// 协调器状态
#[derive(Default, Debug, Clone)]
pub struct ReconcilerState {
    /// 已处理的协调次数
    pub reconciliations: u64,
    /// 失败次数
    pub failures: u64,
    /// 上次协调时间
    pub last_reconcile_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// 协调器结构体
pub struct Reconciler {
    engine: Engine<FlannelConfig>,
    flannel_configs: Arc<dyn ObjectApi<FlannelConfig>>,
    requeue: ControllerConfig,
    state: Arc<RwLock<ReconcilerState>>,
    /// 错误回调是同步的，失败次数单独计数
    failures: AtomicU64,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(
        engine: Engine<FlannelConfig>,
        flannel_configs: Arc<dyn ObjectApi<FlannelConfig>>,
        requeue: ControllerConfig,
    ) -> Self {
        Self {
            engine,
            flannel_configs,
            requeue,
            state: Arc::new(RwLock::new(ReconcilerState::default())),
            failures: AtomicU64::new(0),
        }
    }

    /// 协调 FlannelConfig 资源
    pub async fn reconcile(&self, obj: Arc<FlannelConfig>) -> Result<Action, OperatorError> {
        {
            let mut state = self.state.write().await;
            state.reconciliations += 1;
            state.last_reconcile_time = Some(chrono::Utc::now());
        }

        let key = obj.object_key();

        if obj.is_deleted() {
            if !has_finalizer(&obj) {
                debug!(object = %key, "对象没有 finalizer，无需处理");
                return Ok(Action::await_change());
            }
            return self.reconcile_deleted(&obj).await;
        }

        // 只校验存活对象，已删除对象按能推导出的名称清理
        obj.spec.validate()?;

        let obj = if has_finalizer(&obj) {
            obj
        } else {
            Arc::new(self.add_finalizer(&obj).await?)
        };

        match self.engine.reconcile(&obj).await? {
            Some(PassOutcome::Done) => Ok(Action::requeue(self.requeue.resync())),
            Some(_) => Ok(Action::requeue(self.requeue.short_requeue())),
            None => Ok(Action::await_change()),
        }
    }

    async fn reconcile_deleted(&self, obj: &FlannelConfig) -> Result<Action, OperatorError> {
        // 所有资源名都由集群标识推导
        if key::cluster_id(obj).is_empty() {
            warn!(object = %obj.object_key(), "集群标识为空，无法推导资源名，直接移除 finalizer");
            self.remove_finalizer(obj).await?;
            return Ok(Action::await_change());
        }

        match self.engine.reconcile(obj).await? {
            Some(outcome) if outcome.may_remove_finalizer() => {
                self.remove_finalizer(obj).await?;
                Ok(Action::await_change())
            }
            Some(outcome) => {
                info!(
                    object = %obj.object_key(),
                    cluster = key::cluster_id(obj),
                    outcome = ?outcome,
                    "删除流程未完成，保留 finalizer"
                );
                Ok(Action::requeue(self.requeue.short_requeue()))
            }
            None => Ok(Action::await_change()),
        }
    }

    /// 添加 finalizer，resourceVersion 不一致时由 API 服务器拒绝
    async fn add_finalizer(&self, obj: &FlannelConfig) -> flannel_common::Result<FlannelConfig> {
        let mut updated = obj.clone();
        updated.finalizers_mut().push(FINALIZER.to_string());

        let updated = self
            .flannel_configs
            .replace(obj.namespace().as_deref(), &updated)
            .await?;
        info!(object = %obj.object_key(), "已添加 finalizer");
        Ok(updated)
    }

    async fn remove_finalizer(&self, obj: &FlannelConfig) -> flannel_common::Result<()> {
        let mut updated = obj.clone();
        updated.finalizers_mut().retain(|f| f != FINALIZER);

        match self
            .flannel_configs
            .replace(obj.namespace().as_deref(), &updated)
            .await
        {
            Ok(_) => info!(object = %obj.object_key(), "已移除 finalizer"),
            Err(e) if e.is_not_found() => debug!(object = %obj.object_key(), "对象已不存在"),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// 处理错误
    pub fn handle_error(&self, obj: Arc<FlannelConfig>, error: &OperatorError) -> Action {
        self.failures.fetch_add(1, Ordering::Relaxed);
        error!(object = %obj.object_key(), "协调失败: {}", error);

        Action::requeue(self.requeue.error_requeue())
    }

    /// 获取协调器状态
    pub async fn get_state(&self) -> ReconcilerState {
        let mut state = self.state.read().await.clone();
        state.failures = self.failures.load(Ordering::Relaxed);
        state
    }
}

fn has_finalizer(obj: &FlannelConfig) -> bool {
    obj.finalizers().iter().any(|f| f == FINALIZER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterClients;
    use crate::config::create_default_config;
    use crate::crd::create_example_flannel_config;
    use crate::etcd::Store;
    use crate::resource_set::new_resource_routers;
    use crate::resource_set::tests::test_config;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use prometheus::Registry;
    use std::time::Duration;

    struct Fixture {
        clients: ClusterClients,
        config: crate::resource_set::ResourceSetConfig,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let clients = ClusterClients::in_memory();
        let config = test_config(clients.clone());
        let registry = Registry::new();
        let engine = Engine::new(new_resource_routers(&config, &registry).unwrap())
            .unwrap()
            .with_registry(&registry)
            .unwrap();
        let reconciler = Reconciler::new(
            engine,
            clients.flannel_configs.clone(),
            create_default_config().controller,
        );
        Fixture { clients, config, reconciler }
    }

    async fn stored(clients: &ClusterClients) -> FlannelConfig {
        clients
            .flannel_configs
            .get(Some("default"), "abc12")
            .await
            .unwrap()
            .unwrap()
    }

    async fn mark_deleted(clients: &ClusterClients) -> FlannelConfig {
        let mut obj = stored(clients).await;
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        clients
            .flannel_configs
            .replace(Some("default"), &obj)
            .await
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_live_object_gets_finalizer_and_resources() {
        let f = fixture();
        let obj = f
            .clients
            .flannel_configs
            .create(Some("default"), &create_example_flannel_config("abc12"))
            .await
            .unwrap();

        let action = f.reconciler.reconcile(Arc::new(obj)).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));

        assert!(has_finalizer(&stored(&f.clients).await));
        assert!(f.clients.namespaces.get(None, "flannel-network-abc12").await.unwrap().is_some());
        assert!(f
            .clients
            .cluster_role_bindings
            .get(None, "flannel-network-abc12-psp")
            .await
            .unwrap()
            .is_some());
        assert!(f
            .clients
            .daemon_sets
            .get(Some("flannel-network-abc12"), "flannel-network")
            .await
            .unwrap()
            .is_some());
        assert!(f
            .config
            .store
            .search("coreos.com/network/br-abc12/config")
            .await
            .is_ok());

        let state = f.reconciler.get_state().await;
        assert_eq!(state.reconciliations, 1);
        assert!(state.last_reconcile_time.is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_cluster_pods_keep_finalizer() {
        let f = fixture();
        let obj = f
            .clients
            .flannel_configs
            .create(Some("default"), &create_example_flannel_config("abc12"))
            .await
            .unwrap();
        f.reconciler.reconcile(Arc::new(obj)).await.unwrap();

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("kvm-worker-0".to_string()),
                namespace: Some("abc12".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        f.clients.pods.create(Some("abc12"), &pod).await.unwrap();

        let obj = mark_deleted(&f.clients).await;
        let action = f.reconciler.reconcile(Arc::new(obj)).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));

        // 未执行任何删除
        assert!(has_finalizer(&stored(&f.clients).await));
        assert!(f
            .clients
            .daemon_sets
            .get(Some("flannel-network-abc12"), "flannel-network")
            .await
            .unwrap()
            .is_some());
        assert!(f.clients.namespaces.get(None, "flannel-network-abc12").await.unwrap().is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_completed_deletion_removes_finalizer() {
        let f = fixture();
        let obj = f
            .clients
            .flannel_configs
            .create(Some("default"), &create_example_flannel_config("abc12"))
            .await
            .unwrap();
        f.reconciler.reconcile(Arc::new(obj)).await.unwrap();

        let obj = mark_deleted(&f.clients).await;
        let action = f.reconciler.reconcile(Arc::new(obj)).await.unwrap();
        assert_eq!(action, Action::await_change());

        assert!(!has_finalizer(&stored(&f.clients).await));
        assert!(f.clients.namespaces.list(None, None).await.unwrap().is_empty());
        assert!(f.clients.cluster_role_bindings.list(None, None).await.unwrap().is_empty());
        assert!(f.clients.daemon_sets.list(None, None).await.unwrap().is_empty());
        assert!(f
            .clients
            .service_accounts
            .get(Some("flannel-network-abc12"), "abc12")
            .await
            .unwrap()
            .is_none());
        assert!(f
            .config
            .store
            .search("coreos.com/network/br-abc12/config")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[test_log::test(tokio::test)]
    async fn test_invalid_spec_does_not_block_deletion() {
        let f = fixture();
        let obj = f
            .clients
            .flannel_configs
            .create(Some("default"), &create_example_flannel_config("abc12"))
            .await
            .unwrap();
        f.reconciler.reconcile(Arc::new(obj)).await.unwrap();

        // 加上 finalizer 之后规范被改为无效
        let mut obj = stored(&f.clients).await;
        obj.spec.flannel.spec.network.clear();
        obj.spec.flannel.spec.vni = 0;
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let obj = f.clients.flannel_configs.replace(Some("default"), &obj).await.unwrap();

        let action = f.reconciler.reconcile(Arc::new(obj)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!has_finalizer(&stored(&f.clients).await));
        assert!(f.clients.daemon_sets.list(None, None).await.unwrap().is_empty());
        assert!(f.clients.namespaces.list(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_without_cluster_id_releases_finalizer() {
        let f = fixture();
        let mut obj = create_example_flannel_config("abc12");
        obj.spec.cluster.id.clear();
        obj.finalizers_mut().push(FINALIZER.to_string());
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let obj = f.clients.flannel_configs.create(Some("default"), &obj).await.unwrap();

        let action = f.reconciler.reconcile(Arc::new(obj)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!has_finalizer(&stored(&f.clients).await));
    }

    #[tokio::test]
    async fn test_deleted_without_finalizer_is_ignored() {
        let f = fixture();
        let mut obj = create_example_flannel_config("abc12");
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let action = f.reconciler.reconcile(Arc::new(obj)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(f.clients.namespaces.list(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_version_is_skipped() {
        let f = fixture();
        let mut obj = create_example_flannel_config("abc12");
        obj.spec.version_bundle.version = "9.9.9".to_string();
        let obj = f.clients.flannel_configs.create(Some("default"), &obj).await.unwrap();

        let action = f.reconciler.reconcile(Arc::new(obj)).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(f.clients.namespaces.list(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_spec_and_error_policy() {
        let f = fixture();
        let mut obj = create_example_flannel_config("abc12");
        obj.spec.flannel.spec.network.clear();
        let obj = Arc::new(obj);

        let err = f.reconciler.reconcile(obj.clone()).await.unwrap_err();
        assert!(matches!(err, OperatorError::Object(_)));

        let action = f.reconciler.handle_error(obj, &err);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert_eq!(f.reconciler.get_state().await.failures, 1);
    }

    #[tokio::test]
    async fn test_stale_object_conflicts_on_finalizer() {
        let f = fixture();
        let obj = f
            .clients
            .flannel_configs
            .create(Some("default"), &create_example_flannel_config("abc12"))
            .await
            .unwrap();
        // 对象在读取后被其他写入者修改
        f.clients.flannel_configs.replace(Some("default"), &obj).await.unwrap();

        let err = f.reconciler.reconcile(Arc::new(obj)).await.unwrap_err();
        match err {
            OperatorError::Object(e) => assert!(e.is_retryable()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
