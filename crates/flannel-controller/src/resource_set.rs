//! 资源集合与版本路由
//!
//! 每个资源集合是一代协调逻辑的有序处理器列表，由对象记录的版本包版本选择。
//! 没有记录版本的旧对象交给默认集合处理。

use std::sync::Arc;

use flannel_common::{Error, Result};

use crate::resource::Handler;

/// 某一版本的有序处理器列表
pub struct ResourceSet<O: Send + Sync + 'static> {
    version: String,
    handlers: Vec<Arc<dyn Handler<O>>>,
}

impl<O> ResourceSet<O>
where
    O: Send + Sync + 'static,
{
    /// 创建资源集合
    pub fn new(version: impl Into<String>, handlers: Vec<Arc<dyn Handler<O>>>) -> Result<Self> {
        let version = version.into();
        if version.is_empty() {
            return Err(Error::InvalidConfig("资源集合版本不能为空".into()));
        }
        if handlers.is_empty() {
            return Err(Error::InvalidConfig(format!("资源集合 {version} 没有处理器")));
        }

        Ok(Self { version, handlers })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler<O>>] {
        &self.handlers
    }

    /// 处理器名称，按执行顺序
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

/// 按版本包版本选择资源集合
pub struct ResourceRouter<O: Send + Sync + 'static> {
    sets: Vec<ResourceSet<O>>,
    default_version: Option<String>,
}

impl<O> ResourceRouter<O>
where
    O: Send + Sync + 'static,
{
    /// 创建路由，版本不能重复
    pub fn new(sets: Vec<ResourceSet<O>>) -> Result<Self> {
        for (i, set) in sets.iter().enumerate() {
            if sets[..i].iter().any(|other| other.version == set.version) {
                return Err(Error::InvalidConfig(format!("资源集合版本重复: {}", set.version)));
            }
        }

        Ok(Self {
            sets,
            default_version: None,
        })
    }

    /// 设置默认集合，处理没有记录版本的对象
    pub fn with_default(mut self, version: &str) -> Result<Self> {
        if !self.sets.iter().any(|set| set.version == version) {
            return Err(Error::InvalidConfig(format!("默认资源集合不存在: {version}")));
        }
        self.default_version = Some(version.to_string());
        Ok(self)
    }

    /// 选择资源集合
    ///
    /// 版本精确匹配；版本为空时使用默认集合；版本非空但没有匹配时返回 `None`。
    pub fn select(&self, version: &str) -> Option<&ResourceSet<O>> {
        let wanted = if version.is_empty() {
            self.default_version.as_deref()?
        } else {
            version
        };

        self.sets.iter().find(|set| set.version == wanted)
    }

    /// 所有版本
    pub fn versions(&self) -> Vec<&str> {
        self.sets.iter().map(|set| set.version.as_str()).collect()
    }
}

/// 依次尝试每个路由，第一个匹配的生效
pub fn route<'a, O>(routers: &'a [ResourceRouter<O>], version: &str) -> Option<&'a ResourceSet<O>>
where
    O: Send + Sync + 'static,
{
    routers.iter().find_map(|router| router.select(version))
}
