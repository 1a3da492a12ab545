//! 协调错误

use std::fmt;
use thiserror::Error;

/// 协调阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchingCurrent,
    FetchingDesired,
    ComputingPatch,
    Applying,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::FetchingCurrent => "获取当前状态",
            Stage::FetchingDesired => "计算期望状态",
            Stage::ComputingPatch => "计算补丁",
            Stage::Applying => "应用变更",
        };
        f.write_str(s)
    }
}

/// 一轮协调的错误
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// 处理器在某个阶段失败
    #[error("资源 {resource} 在{stage}阶段失败: {source}")]
    Resource {
        resource: String,
        stage: Stage,
        #[source]
        source: flannel_common::Error,
    },

    /// 其他错误
    #[error(transparent)]
    Other(#[from] flannel_common::Error),
}

impl ReconcileError {
    /// 构造处理器阶段错误
    pub fn resource(resource: &str, stage: Stage, source: flannel_common::Error) -> Self {
        ReconcileError::Resource {
            resource: resource.to_string(),
            stage,
            source,
        }
    }

    /// 失败的处理器名称
    pub fn resource_name(&self) -> Option<&str> {
        match self {
            ReconcileError::Resource { resource, .. } => Some(resource),
            ReconcileError::Other(_) => None,
        }
    }

    /// 底层错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Resource { source, .. } => source.is_retryable(),
            ReconcileError::Other(e) => e.is_retryable(),
        }
    }
}
