//! 处理器契约
//!
//! `Resource` 是带类型状态的处理器接口，每个受管方面（RBAC、命名空间、网络配置、
//! DaemonSet 等）各实现一个。`Handler` 是引擎使用的对象安全视图，任何 `Resource`
//! 都自动实现它。

use async_trait::async_trait;
use flannel_common::Result;
use tracing::debug;

use crate::error::{ReconcileError, Stage};
use crate::flow::Flow;
use crate::patch::Patch;
use crate::state::State;

/// 带类型状态的处理器
#[async_trait]
pub trait Resource<O>: Send + Sync
where
    O: Send + Sync + 'static,
{
    /// 处理器状态类型
    type State: State;

    /// 处理器名称，用于日志与指标
    fn name(&self) -> &str;

    /// 查询外部系统中的当前状态，资源不存在时返回空状态
    async fn get_current_state(&self, obj: &O) -> Result<Flow<Self::State>>;

    /// 根据受管对象计算期望状态，不做任何 I/O
    async fn get_desired_state(&self, obj: &O) -> Result<Self::State>;

    /// 计算创建/更新补丁
    fn new_update_patch(
        &self,
        _obj: &O,
        current: &Self::State,
        desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        Ok(Patch::create_or_update(current, desired))
    }

    /// 计算删除补丁，删除槽为当前状态
    fn new_delete_patch(
        &self,
        _obj: &O,
        current: &Self::State,
        _desired: &Self::State,
    ) -> Result<Patch<Self::State>> {
        Ok(Patch::delete(current))
    }

    /// 应用创建变更
    async fn apply_create_change(&self, obj: &O, state: &Self::State) -> Result<Flow<()>>;

    /// 应用更新变更
    async fn apply_update_change(&self, obj: &O, state: &Self::State) -> Result<Flow<()>>;

    /// 应用删除变更
    async fn apply_delete_change(&self, obj: &O, state: &Self::State) -> Result<Flow<()>>;
}

/// 引擎使用的对象安全处理器
#[async_trait]
pub trait Handler<O>: Send + Sync
where
    O: Send + Sync + 'static,
{
    /// 处理器名称
    fn name(&self) -> &str;

    /// 对存活对象执行一次创建/更新循环
    async fn ensure_created(&self, obj: &O) -> std::result::Result<Flow<()>, ReconcileError>;

    /// 对已标记删除的对象执行一次删除循环
    async fn ensure_deleted(&self, obj: &O) -> std::result::Result<Flow<()>, ReconcileError>;
}

#[async_trait]
impl<O, R> Handler<O> for R
where
    O: Send + Sync + 'static,
    R: Resource<O>,
{
    fn name(&self) -> &str {
        Resource::name(self)
    }

    async fn ensure_created(&self, obj: &O) -> std::result::Result<Flow<()>, ReconcileError> {
        let name = Resource::name(self);
        let at = |stage| move |e| ReconcileError::resource(name, stage, e);

        let current = match self.get_current_state(obj).await.map_err(at(Stage::FetchingCurrent))? {
            Flow::Continue(current) => current,
            signal => return Ok(signal.map(|_| ())),
        };
        let desired = self.get_desired_state(obj).await.map_err(at(Stage::FetchingDesired))?;
        let patch = self
            .new_update_patch(obj, &current, &desired)
            .map_err(at(Stage::ComputingPatch))?;

        if patch.is_empty() {
            debug!(resource = name, "当前状态与期望状态一致");
            return Ok(Flow::proceed());
        }

        if let Some(state) = patch.create_change() {
            debug!(resource = name, "应用创建变更");
            let flow = self.apply_create_change(obj, state).await.map_err(at(Stage::Applying))?;
            if !flow.is_continue() {
                return Ok(flow);
            }
        }

        if let Some(state) = patch.update_change() {
            debug!(resource = name, "应用更新变更");
            let flow = self.apply_update_change(obj, state).await.map_err(at(Stage::Applying))?;
            if !flow.is_continue() {
                return Ok(flow);
            }
        }

        Ok(Flow::proceed())
    }

    async fn ensure_deleted(&self, obj: &O) -> std::result::Result<Flow<()>, ReconcileError> {
        let name = Resource::name(self);
        let at = |stage| move |e| ReconcileError::resource(name, stage, e);

        let current = match self.get_current_state(obj).await.map_err(at(Stage::FetchingCurrent))? {
            Flow::Continue(current) => current,
            signal => return Ok(signal.map(|_| ())),
        };
        let desired = self.get_desired_state(obj).await.map_err(at(Stage::FetchingDesired))?;
        let patch = self
            .new_delete_patch(obj, &current, &desired)
            .map_err(at(Stage::ComputingPatch))?;

        match patch.delete_change() {
            Some(state) => {
                debug!(resource = name, "应用删除变更");
                self.apply_delete_change(obj, state).await.map_err(at(Stage::Applying))
            }
            None => {
                debug!(resource = name, "资源已不存在");
                Ok(Flow::proceed())
            }
        }
    }
}
