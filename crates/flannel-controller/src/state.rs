//! 处理器状态
//!
//! 每个处理器都有自己的状态类型，引擎只需要知道状态是否为空以及能否比较。

use std::fmt::Debug;

/// 处理器状态约束
pub trait State: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// 是否为空状态（对应资源尚不存在）
    fn is_empty(&self) -> bool;
}

impl<T> State for Option<T>
where
    T: Clone + Debug + PartialEq + Send + Sync + 'static,
{
    fn is_empty(&self) -> bool {
        self.is_none()
    }
}

impl<T> State for Vec<T>
where
    T: Clone + Debug + PartialEq + Send + Sync + 'static,
{
    fn is_empty(&self) -> bool {
        Vec::is_empty(self)
    }
}

impl State for flannel_common::NetworkConfig {
    fn is_empty(&self) -> bool {
        flannel_common::NetworkConfig::is_empty(self)
    }
}
