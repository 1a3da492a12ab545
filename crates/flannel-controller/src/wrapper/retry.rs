//! 重试装饰器
//!
//! 对处理器的状态查询与变更应用分别进行指数退避重试。只有可重试的瞬时错误会进入
//! 重试，致命错误（配置无效、类型不匹配等）立即返回。

use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use flannel_common::{Error, Result};

use crate::flow::Flow;
use crate::patch::Patch;
use crate::resource::Resource;

/// 指数退避策略
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// 首次重试间隔
    pub initial_interval: Duration,
    /// 最大重试间隔
    pub max_interval: Duration,
    /// 间隔增长倍数
    pub multiplier: f64,
    /// 最长总耗时，超过后返回最后一次错误
    pub max_elapsed_time: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::with_max_elapsed(Duration::from_secs(5 * 60))
    }
}

impl BackoffPolicy {
    /// 使用默认间隔，指定最长总耗时
    pub fn with_max_elapsed(max_elapsed_time: Duration) -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            max_elapsed_time,
        }
    }

    /// 校验策略
    pub fn validate(&self) -> Result<()> {
        if self.initial_interval.is_zero() {
            return Err(Error::InvalidConfig("退避初始间隔必须大于 0".into()));
        }
        if self.max_interval < self.initial_interval {
            return Err(Error::InvalidConfig("退避最大间隔不能小于初始间隔".into()));
        }
        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfig("退避倍数不能小于 1".into()));
        }
        Ok(())
    }

    fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(Some(self.max_elapsed_time))
            .build()
    }
}

/// 按策略重试一个操作
///
/// 每次失败都会记录日志；致命错误不重试。
pub async fn retry_operation<T, F, Fut>(
    policy: &BackoffPolicy,
    resource: &str,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    backoff::future::retry_notify(
        policy.to_backoff(),
        || {
            let fut = f();
            async move {
                fut.await.map_err(|e| {
                    if e.is_retryable() {
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        },
        |e: Error, wait: Duration| {
            warn!(resource, operation, "操作失败，{:?} 后重试: {}", wait, e);
        },
    )
    .await
}

/// 重试装饰器
pub struct RetryResource<R> {
    inner: R,
    policy: BackoffPolicy,
}

impl<R> RetryResource<R> {
    /// 用给定策略包装处理器
    pub fn new(inner: R, policy: BackoffPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { inner, policy })
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[async_trait]
impl<O, R> Resource<O> for RetryResource<R>
where
    O: Send + Sync + 'static,
    R: Resource<O>,
{
    type State = R::State;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_current_state(&self, obj: &O) -> Result<Flow<Self::State>> {
        let inner = &self.inner;
        retry_operation(&self.policy, inner.name(), "get_current_state", move || {
            inner.get_current_state(obj)
        })
        .await
    }

    async fn get_desired_state(&self, obj: &O) -> Result<Self::State> {
        let inner = &self.inner;
        retry_operation(&self.policy, inner.name(), "get_desired_state", move || {
            inner.get_desired_state(obj)
        })
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
        let inner = &self.inner;
        retry_operation(&self.policy, inner.name(), "apply_create_change", move || {
            inner.apply_create_change(obj, state)
        })
        .await
    }

    async fn apply_update_change(&self, obj: &O, state: &Self::State) -> Result<Flow<()>> {
        let inner = &self.inner;
        retry_operation(&self.policy, inner.name(), "apply_update_change", move || {
            inner.apply_update_change(obj, state)
        })
        .await
    }

    async fn apply_delete_change(&self, obj: &O, state: &Self::State) -> Result<Flow<()>> {
        let inner = &self.inner;
        retry_operation(&self.policy, inner.name(), "apply_delete_change", move || {
            inner.apply_delete_change(obj, state)
        })
        .await
    }
}
