//! Flannel Operator Common - 跨模块共享的错误类型与数据结构
//!
//! 该模块提供 Flannel Operator 中所有组件共享的数据结构与统一错误处理，
//! 包括持久化到配置存储中的网络配置条目和版本包元数据。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::Error;
pub use error::Result;
pub use models::network_config::*;
pub use models::version_bundle::*;
