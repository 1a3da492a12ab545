//! 控制流信号
//!
//! 处理器通过返回值而不是共享的可变上下文影响本轮协调的走向。

/// 处理器步骤的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<T> {
    /// 继续执行，携带本步骤的结果
    Continue(T),
    /// 取消本轮剩余的处理器
    Cancel,
    /// 取消本轮剩余的处理器，并且不允许移除 finalizer
    KeepFinalizer,
}

impl<T> Flow<T> {
    /// 是否继续执行
    pub fn is_continue(&self) -> bool {
        matches!(self, Flow::Continue(_))
    }

    /// 转换携带的结果
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Flow<U> {
        match self {
            Flow::Continue(value) => Flow::Continue(f(value)),
            Flow::Cancel => Flow::Cancel,
            Flow::KeepFinalizer => Flow::KeepFinalizer,
        }
    }

    /// 拆分为继续时的值或中止信号
    pub fn into_value(self) -> std::result::Result<T, Flow<()>> {
        match self {
            Flow::Continue(value) => Ok(value),
            Flow::Cancel => Err(Flow::Cancel),
            Flow::KeepFinalizer => Err(Flow::KeepFinalizer),
        }
    }
}

impl Flow<()> {
    /// 继续执行
    pub fn proceed() -> Self {
        Flow::Continue(())
    }
}
