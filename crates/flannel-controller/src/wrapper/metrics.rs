//! 指标装饰器
//!
//! 记录每个处理器操作的成功/失败次数与耗时，不改变控制流和错误值。

use async_trait::async_trait;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::future::Future;

use flannel_common::{Error, Result};

use crate::flow::Flow;
use crate::patch::Patch;
use crate::resource::Resource;

/// 处理器操作指标
#[derive(Clone)]
pub struct ResourceMetrics {
    /// 操作计数器
    operations: IntCounterVec,
    /// 操作耗时
    duration: HistogramVec,
}

impl ResourceMetrics {
    /// 创建指标并注册到注册表，每个注册表只需创建一次
    pub fn new(registry: &Registry) -> Result<Self> {
        let operations = IntCounterVec::new(
            Opts::new(
                "flannel_operator_resource_operation_total",
                "Number of resource operations by result",
            ),
            &["resource", "operation", "result"],
        )
        .map_err(metrics_error)?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "flannel_operator_resource_operation_duration_seconds",
                "Duration of resource operations",
            ),
            &["resource", "operation"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(operations.clone())).map_err(metrics_error)?;
        registry.register(Box::new(duration.clone())).map_err(metrics_error)?;

        Ok(Self { operations, duration })
    }

    /// 记录一次操作
    async fn observe<T, Fut>(&self, resource: &str, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let timer = self
            .duration
            .with_label_values(&[resource, operation])
            .start_timer();
        let result = fut.await;
        timer.observe_duration();

        let outcome = if result.is_ok() { "success" } else { "failure" };
        self.operations
            .with_label_values(&[resource, operation, outcome])
            .inc();

        result
    }

    /// 读取计数器的值
    pub fn operation_count(&self, resource: &str, operation: &str, result: &str) -> u64 {
        self.operations
            .with_label_values(&[resource, operation, result])
            .get()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::InvalidConfig(format!("注册处理器指标失败: {e}"))
}

/// 指标装饰器
pub struct MetricsResource<R> {
    inner: R,
    metrics: ResourceMetrics,
}

impl<R> MetricsResource<R> {
    pub fn new(inner: R, metrics: ResourceMetrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl<O, R> Resource<O> for MetricsResource<R>
where
    O: Send + Sync + 'static,
    R: Resource<O>,
{
    type State = R::State;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_current_state(&self, obj: &O) -> Result<Flow<Self::State>> {
        self.metrics
            .observe(self.inner.name(), "get_current_state", self.inner.get_current_state(obj))
            .await
    }

    async fn get_desired_state(&self, obj: &O) -> Result<Self::State> {
        self.metrics
            .observe(self.inner.name(), "get_desired_state", self.inner.get_desired_state(obj))
            .await
    }

    fn new_update_patch(
        &self,
        obj: &O,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        self.inner.new_update_patch(obj, current, desired)
    }

    fn new_delete_patch(
        &self,
        obj: &O,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        self.inner.new_delete_patch(obj, current, desired)
    }

    async fn apply_create_change(&self, obj: &O, state: &Self::State) -> Result<Flow<()>> {
        self.metrics
            .observe(self.inner.name(), "apply_create_change", self.inner.apply_create_change(obj, state))
            .await
    }

    async fn apply_update_change(&self, obj: &O, state: &Self::State) -> Result<Flow<()>> {
        self.metrics
            .observe(self.inner.name(), "apply_update_change", self.inner.apply_update_change(obj, state))
            .await
    }

    async fn apply_delete_change(&self, obj: &O, state: &Self::State) -> Result<Flow<()>> {
        self.metrics
            .observe(self.inner.name(), "apply_delete_change", self.inner.apply_delete_change(obj, state))
            .await
    }
}
