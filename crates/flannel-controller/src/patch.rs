//! 补丁
//!
//! 补丁有创建、更新、删除三个槽位，由处理器根据当前状态与期望状态计算，
//! 再由引擎依次应用。

use crate::state::State;

/// 创建/更新/删除三槽补丁
#[derive(Debug, Clone, PartialEq)]
pub struct Patch<S> {
    create: Option<S>,
    update: Option<S>,
    delete: Option<S>,
}

impl<S> Default for Patch<S> {
    fn default() -> Self {
        Self {
            create: None,
            update: None,
            delete: None,
        }
    }
}

impl<S: State> Patch<S> {
    /// 创建空补丁
    pub fn new() -> Self {
        Self::default()
    }

    /// 根据当前状态与期望状态计算创建或更新补丁
    ///
    /// 当前为空而期望非空时填充创建槽；两者都非空且不相等时填充更新槽。
    pub fn create_or_update(current: &S, desired: &S) -> Self {
        let mut patch = Self::new();

        if current.is_empty() {
            if !desired.is_empty() {
                patch.set_create_change(desired.clone());
            }
        } else if !desired.is_empty() && current != desired {
            patch.set_update_change(desired.clone());
        }

        patch
    }

    /// 根据当前状态计算删除补丁，删除槽始终是当前实际存在的状态
    pub fn delete(current: &S) -> Self {
        let mut patch = Self::new();
        if !current.is_empty() {
            patch.set_delete_change(current.clone());
        }
        patch
    }

    pub fn set_create_change(&mut self, state: S) {
        self.create = Some(state);
    }

    pub fn set_update_change(&mut self, state: S) {
        self.update = Some(state);
    }

    pub fn set_delete_change(&mut self, state: S) {
        self.delete = Some(state);
    }

    pub fn create_change(&self) -> Option<&S> {
        self.create.as_ref()
    }

    pub fn update_change(&self) -> Option<&S> {
        self.update.as_ref()
    }

    pub fn delete_change(&self) -> Option<&S> {
        self.delete.as_ref()
    }

    /// 三个槽位是否都为空
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.update.is_none() && self.delete.is_none()
    }
}
