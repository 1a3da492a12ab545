//! Flannel 协调引擎
//!
//! 该模块实现与具体资源无关的协调框架：处理器在每一轮协调中计算当前状态、期望状态
//! 和补丁，引擎按顺序（删除时逆序）驱动处理器，并处理取消与保留 finalizer 信号。

pub mod error;
pub mod flow;
pub mod state;
pub mod patch;
pub mod resource;
pub mod resource_set;
pub mod engine;
pub mod wrapper;

/// 重新导出常用类型，方便使用
pub use engine::{run_pass, Engine, ManagedObject, PassOutcome};
pub use error::{ReconcileError, Stage};
pub use flow::Flow;
pub use patch::Patch;
pub use resource::{Handler, Resource};
pub use resource_set::{route, ResourceRouter, ResourceSet};
pub use state::State;
pub use wrapper::metrics::{MetricsResource, ResourceMetrics};
pub use wrapper::retry::{retry_operation, BackoffPolicy, RetryResource};
