//! 数据模型模块
//!
//! 包含网络配置条目与版本包等共享数据模型。

pub mod network_config;
pub mod version_bundle;
