//! 处理器装饰器
//!
//! 重试装饰器按指数退避重试瞬时错误，指标装饰器记录每个操作的结果与耗时。
//! 两者都实现 `Resource`，可以层层包装。

pub mod metrics;
pub mod retry;
