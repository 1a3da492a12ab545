//! 协调引擎
//!
//! 对单个受管对象执行一轮协调：通过路由选出处理器列表，存活对象按声明顺序执行，
//! 已标记删除的对象逆序执行。任一处理器返回取消或保留 finalizer 信号时，
//! 跳过剩余处理器。

use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::Arc;
use tracing::{debug, info, warn};

use flannel_common::Error;

use crate::error::ReconcileError;
use crate::flow::Flow;
use crate::resource::Handler;
use crate::resource_set::{route, ResourceRouter, ResourceSet};

/// 引擎需要的受管对象信息
pub trait ManagedObject: Send + Sync + 'static {
    /// 对象键，用于日志
    fn object_key(&self) -> String;

    /// 是否已被标记删除
    fn is_deleted(&self) -> bool;

    /// 对象记录的版本包版本，未记录时为空字符串
    fn version_bundle_version(&self) -> String;
}

/// 一轮协调的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// 所有处理器都已执行
    Done,
    /// 某个处理器取消了本轮
    Canceled { resource: String },
    /// 某个处理器要求保留 finalizer
    FinalizerKept { resource: String },
}

impl PassOutcome {
    /// 调用方是否可以移除 finalizer
    pub fn may_remove_finalizer(&self) -> bool {
        matches!(self, PassOutcome::Done)
    }

    fn label(&self) -> &'static str {
        match self {
            PassOutcome::Done => "done",
            PassOutcome::Canceled { .. } => "canceled",
            PassOutcome::FinalizerKept { .. } => "finalizer_kept",
        }
    }
}

/// 对一个对象执行一轮协调
///
/// `deleting` 为真时逆序调用处理器的删除循环。
pub async fn run_pass<O>(
    handlers: &[Arc<dyn Handler<O>>],
    obj: &O,
    deleting: bool,
) -> Result<PassOutcome, ReconcileError>
where
    O: Send + Sync + 'static,
{
    let ordered: Vec<&Arc<dyn Handler<O>>> = if deleting {
        handlers.iter().rev().collect()
    } else {
        handlers.iter().collect()
    };

    for handler in ordered {
        let flow = if deleting {
            handler.ensure_deleted(obj).await?
        } else {
            handler.ensure_created(obj).await?
        };

        match flow {
            Flow::Continue(()) => {}
            Flow::Cancel => {
                debug!(resource = handler.name(), "处理器取消了本轮协调");
                return Ok(PassOutcome::Canceled {
                    resource: handler.name().to_string(),
                });
            }
            Flow::KeepFinalizer => {
                debug!(resource = handler.name(), "处理器要求保留 finalizer");
                return Ok(PassOutcome::FinalizerKept {
                    resource: handler.name().to_string(),
                });
            }
        }
    }

    Ok(PassOutcome::Done)
}

/// 协调引擎
pub struct Engine<O: ManagedObject> {
    /// 按优先级排列的路由，第一个匹配的生效
    routers: Vec<ResourceRouter<O>>,
    /// 协调结果计数器
    reconciliations: Option<IntCounterVec>,
}

impl<O: ManagedObject> Engine<O> {
    /// 创建引擎
    pub fn new(routers: Vec<ResourceRouter<O>>) -> flannel_common::Result<Self> {
        if routers.is_empty() {
            return Err(Error::InvalidConfig("引擎至少需要一个资源路由".into()));
        }

        Ok(Self {
            routers,
            reconciliations: None,
        })
    }

    /// 在注册表中注册协调结果计数器
    pub fn with_registry(mut self, registry: &Registry) -> flannel_common::Result<Self> {
        let counter = IntCounterVec::new(
            Opts::new(
                "flannel_operator_reconciliation_total",
                "Number of reconciliation passes by outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| Error::InvalidConfig(format!("创建协调计数器失败: {e}")))?;
        registry
            .register(Box::new(counter.clone()))
            .map_err(|e| Error::InvalidConfig(format!("注册协调计数器失败: {e}")))?;

        self.reconciliations = Some(counter);
        Ok(self)
    }

    /// 为对象选择处理器列表
    pub fn resolve(&self, obj: &O) -> Option<&ResourceSet<O>> {
        route(&self.routers, &obj.version_bundle_version())
    }

    /// 协调一个对象，没有匹配的处理器列表时返回 `None`
    pub async fn reconcile(&self, obj: &O) -> Result<Option<PassOutcome>, ReconcileError> {
        let key = obj.object_key();
        let Some(set) = self.resolve(obj) else {
            debug!(object = %key, version = %obj.version_bundle_version(), "没有匹配的资源集合");
            return Ok(None);
        };

        let deleting = obj.is_deleted();
        debug!(object = %key, version = set.version(), deleting, "开始协调");

        let result = run_pass(set.handlers(), obj, deleting).await;
        match &result {
            Ok(outcome) => {
                self.count(outcome.label());
                match outcome {
                    PassOutcome::Done => info!(object = %key, deleting, "协调完成"),
                    other => info!(object = %key, deleting, outcome = ?other, "协调提前结束"),
                }
            }
            Err(e) => {
                self.count("failed");
                warn!(object = %key, deleting, "协调失败: {}", e);
            }
        }

        result.map(Some)
    }

    fn count(&self, outcome: &str) {
        if let Some(counter) = &self.reconciliations {
            counter.with_label_values(&[outcome]).inc();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::patch::Patch;
    use crate::resource::Resource;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// 测试用的受管对象
    #[derive(Debug, Clone, Default)]
    pub struct TestObject {
        pub name: String,
        pub deleted: bool,
        pub version: String,
    }

    impl ManagedObject for TestObject {
        fn object_key(&self) -> String {
            self.name.clone()
        }

        fn is_deleted(&self) -> bool {
            self.deleted
        }

        fn version_bundle_version(&self) -> String {
            self.version.clone()
        }
    }

    /// 共享的调用记录与"外部系统"
    #[derive(Default)]
    pub struct World {
        pub calls: Mutex<Vec<String>>,
        pub existing: Mutex<HashSet<String>>,
    }

    impl World {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    /// 测试处理器，状态为资源名是否存在
    pub struct TestResource {
        pub name: String,
        pub world: Arc<World>,
        /// 依赖的资源，当前状态查询时必须已存在
        pub depends_on: Option<String>,
        pub signal: Option<Flow<()>>,
    }

    impl TestResource {
        pub fn new(name: &str, world: Arc<World>) -> Self {
            Self {
                name: name.to_string(),
                world,
                depends_on: None,
                signal: None,
            }
        }
    }

    #[async_trait]
    impl Resource<TestObject> for TestResource {
        type State = Option<String>;

        fn name(&self) -> &str {
            &self.name
        }

        async fn get_current_state(&self, _obj: &TestObject) -> flannel_common::Result<Flow<Self::State>> {
            self.world.record(format!("current:{}", self.name));

            if let Some(dep) = &self.depends_on {
                if !self.world.existing.lock().unwrap().contains(dep) {
                    return Err(Error::NotFound(dep.clone()));
                }
            }
            if let Some(signal) = &self.signal {
                return Ok(signal.clone().map(|_| None));
            }

            let exists = self.world.existing.lock().unwrap().contains(&self.name);
            Ok(Flow::Continue(exists.then(|| self.name.clone())))
        }

        async fn get_desired_state(&self, _obj: &TestObject) -> flannel_common::Result<Self::State> {
            Ok(Some(self.name.clone()))
        }

        async fn apply_create_change(&self, _obj: &TestObject, state: &Self::State) -> flannel_common::Result<Flow<()>> {
            self.world.record(format!("create:{}", self.name));
            if let Some(name) = state {
                self.world.existing.lock().unwrap().insert(name.clone());
            }
            Ok(Flow::proceed())
        }

        async fn apply_update_change(&self, _obj: &TestObject, _state: &Self::State) -> flannel_common::Result<Flow<()>> {
            self.world.record(format!("update:{}", self.name));
            Ok(Flow::proceed())
        }

        async fn apply_delete_change(&self, _obj: &TestObject, state: &Self::State) -> flannel_common::Result<Flow<()>> {
            self.world.record(format!("delete:{}", self.name));
            if let Some(name) = state {
                self.world.existing.lock().unwrap().remove(name);
            }
            Ok(Flow::proceed())
        }
    }

    fn handlers(resources: Vec<TestResource>) -> Vec<Arc<dyn Handler<TestObject>>> {
        resources
            .into_iter()
            .map(|r| Arc::new(r) as Arc<dyn Handler<TestObject>>)
            .collect()
    }

    #[tokio::test]
    async fn test_ordered_pass_satisfies_dependencies() {
        let world = Arc::new(World::default());
        let mut b = TestResource::new("b", world.clone());
        b.depends_on = Some("a".into());
        let list = handlers(vec![TestResource::new("a", world.clone()), b]);

        let outcome = run_pass(&list, &TestObject::default(), false).await.unwrap();
        assert_eq!(outcome, PassOutcome::Done);
        assert_eq!(
            world.calls(),
            vec!["current:a", "create:a", "current:b", "create:b"]
        );

        // 第二轮当前状态与期望一致，不再有变更
        world.calls.lock().unwrap().clear();
        run_pass(&list, &TestObject::default(), false).await.unwrap();
        assert_eq!(world.calls(), vec!["current:a", "current:b"]);
    }

    #[tokio::test]
    async fn test_reversed_list_fails_dependency() {
        let world = Arc::new(World::default());
        let mut b = TestResource::new("b", world.clone());
        b.depends_on = Some("a".into());
        let list = handlers(vec![b, TestResource::new("a", world.clone())]);

        let err = run_pass(&list, &TestObject::default(), false).await.unwrap_err();
        assert_eq!(err.resource_name(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_pass_runs_in_reverse() {
        let world = Arc::new(World::default());
        world.existing.lock().unwrap().extend(["a".to_string(), "b".to_string()]);
        let list = handlers(vec![
            TestResource::new("a", world.clone()),
            TestResource::new("b", world.clone()),
        ]);

        let outcome = run_pass(&list, &TestObject::default(), true).await.unwrap();
        assert_eq!(outcome, PassOutcome::Done);
        assert!(outcome.may_remove_finalizer());
        assert_eq!(
            world.calls(),
            vec!["current:b", "delete:b", "current:a", "delete:a"]
        );

        // 再次删除时资源已不存在
        world.calls.lock().unwrap().clear();
        run_pass(&list, &TestObject::default(), true).await.unwrap();
        assert_eq!(world.calls(), vec!["current:b", "current:a"]);
    }

    #[tokio::test]
    async fn test_cancel_short_circuits() {
        let world = Arc::new(World::default());
        let mut b = TestResource::new("b", world.clone());
        b.signal = Some(Flow::Cancel);
        let list = handlers(vec![
            TestResource::new("a", world.clone()),
            b,
            TestResource::new("c", world.clone()),
        ]);

        let outcome = run_pass(&list, &TestObject::default(), false).await.unwrap();
        assert_eq!(outcome, PassOutcome::Canceled { resource: "b".into() });
        assert!(!world.calls().iter().any(|c| c.ends_with(":c")));
    }

    #[tokio::test]
    async fn test_finalizer_kept_on_delete() {
        let world = Arc::new(World::default());
        world.existing.lock().unwrap().extend(["a".to_string(), "c".to_string()]);
        let mut b = TestResource::new("b", world.clone());
        b.signal = Some(Flow::KeepFinalizer);
        let list = handlers(vec![
            TestResource::new("a", world.clone()),
            b,
            TestResource::new("c", world.clone()),
        ]);

        let outcome = run_pass(&list, &TestObject::default(), true).await.unwrap();
        assert_eq!(outcome, PassOutcome::FinalizerKept { resource: "b".into() });
        assert!(!outcome.may_remove_finalizer());
        // c 在 b 之前删除，a 没有被执行
        assert_eq!(world.calls(), vec!["current:c", "delete:c", "current:b"]);
    }

    #[tokio::test]
    async fn test_engine_routes_by_version() {
        let world = Arc::new(World::default());
        let set = ResourceSet::new("0.1.0", handlers(vec![TestResource::new("a", world.clone())])).unwrap();
        let router = ResourceRouter::new(vec![set]).unwrap().with_default("0.1.0").unwrap();
        let registry = Registry::new();
        let engine = Engine::new(vec![router]).unwrap().with_registry(&registry).unwrap();

        let unknown = TestObject { name: "x".into(), version: "9.9.9".into(), ..Default::default() };
        assert_eq!(engine.reconcile(&unknown).await.unwrap(), None);
        assert!(world.calls().is_empty());

        let legacy = TestObject { name: "y".into(), ..Default::default() };
        assert_eq!(engine.reconcile(&legacy).await.unwrap(), Some(PassOutcome::Done));
        assert_eq!(world.calls(), vec!["current:a", "create:a"]);

        let families = registry.gather();
        assert_eq!(families[0].get_name(), "flannel_operator_reconciliation_total");
    }

    #[test]
    fn test_engine_requires_router() {
        assert!(Engine::<TestObject>::new(vec![]).is_err());
    }

    #[test]
    fn test_update_patch_for_test_resource() {
        let world = Arc::new(World::default());
        let r = TestResource::new("a", world);
        let patch = r
            .new_update_patch(&TestObject::default(), &Some("old".into()), &Some("a".into()))
            .unwrap();
        assert_eq!(patch.update_change(), Some(&Some("a".to_string())));
        assert_eq!(Patch::<Option<String>>::new(), Patch::default());
    }
}
