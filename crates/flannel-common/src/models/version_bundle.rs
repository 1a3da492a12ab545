//! 版本包模型
//!
//! 版本包描述某一代协调逻辑对应的组件版本与变更记录。

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 版本包
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VersionBundle {
    /// 名称
    pub name: String,
    /// 版本
    pub version: String,
    /// 组件列表
    pub components: Vec<Component>,
    /// 变更记录
    pub changelogs: Vec<Changelog>,
}

/// 组件
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Component {
    /// 组件名称
    pub name: String,
    /// 组件版本
    pub version: String,
}

/// 变更记录
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Changelog {
    /// 变更的组件
    pub component: String,
    /// 变更描述
    pub description: String,
    /// 变更类型，例如 added、changed
    pub kind: String,
}

/// 语义化版本号的三段，按 major、minor、patch 依次比较
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    /// 解析 `major.minor.patch` 形式的版本号
    pub fn parse(version: &str) -> Result<Self> {
        let parts: Vec<&str> = version.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(Error::InvalidConfig(format!("版本号格式无效: {version}")));
        }

        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| Error::InvalidConfig(format!("版本号格式无效: {version}")))
        };

        Ok(Self {
            major: parse(parts[0])?,
            minor: parse(parts[1])?,
            patch: parse(parts[2])?,
        })
    }
}

impl VersionBundle {
    /// 校验版本包
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("版本包名称不能为空".into()));
        }
        SemVer::parse(&self.version)?;
        if self.components.is_empty() {
            return Err(Error::InvalidConfig(format!("版本包 {} 没有组件", self.version)));
        }
        Ok(())
    }
}
