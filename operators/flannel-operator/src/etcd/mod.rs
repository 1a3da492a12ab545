//! 配置存储模块
//!
//! flanneld 从分层的键值存储中读取网络配置。该模块定义存储接口，
//! 并提供基于 etcd v2 HTTP API 的实现，测试使用内存实现。

#[cfg(test)]
mod memory;
mod v2;

#[cfg(test)]
pub use memory::MemoryStore;
pub use v2::{EtcdTls, EtcdV2Store};

use async_trait::async_trait;

use flannel_common::Result;

/// 键值存储接口
///
/// 路径以 `/` 分隔，开头的 `/` 可有可无。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// 创建键，已存在时返回 `AlreadyExists`
    async fn create(&self, key: &str, value: &str) -> Result<()>;

    /// 递归删除键，不存在时返回 `NotFound`
    async fn delete(&self, key: &str) -> Result<()>;

    /// 键是否存在
    async fn exists(&self, key: &str) -> Result<bool>;

    /// 列出前缀下直接子键的值
    async fn list(&self, key: &str) -> Result<Vec<String>>;

    /// 读取键的值
    ///
    /// 不存在时返回 `NotFound`；目录下有多个值时返回 `MultipleValues`。
    async fn search(&self, key: &str) -> Result<String>;
}

/// 去掉路径首尾的 `/`
pub(crate) fn normalize_key(key: &str) -> String {
    key.trim_matches('/').to_string()
}
