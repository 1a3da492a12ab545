//! 错误处理模块
//!
//! 该模块提供 Flannel Operator 的统一错误类型，区分致命错误与可重试的瞬时错误，
//! 并能识别配置存储与 Kubernetes API 返回的"不存在"和"已存在"两类预期错误。

use thiserror::Error;

/// Flannel Operator 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置无效，构造处理器或启动时缺少必需的依赖或字段
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 类型不匹配，通常出现在解码持久化的 JSON 时
    #[error("类型不匹配: 期望 {expected}, 实际 {got}")]
    WrongType { expected: String, got: String },

    /// 配置存储中路径不存在
    #[error("路径不存在: {0}")]
    NotFound(String),

    /// 配置存储中路径已存在
    #[error("路径已存在: {0}")]
    AlreadyExists(String),

    /// 路径下存在多个值
    #[error("路径下存在多个值: {0}")]
    MultipleValues(String),

    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(#[from] kube::Error),

    /// etcd 请求错误
    #[error("etcd 请求错误: {0}")]
    Etcd(String),

    /// 等待超时
    #[error("等待超时: {0}")]
    Timeout(String),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

/// Flannel Operator 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 构造类型不匹配错误
    pub fn wrong_type(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Error::WrongType {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// 是否为可重试的瞬时错误
    ///
    /// 配置无效、类型不匹配以及 Kubernetes 返回的 400/422 属于致命错误，
    /// 重试不会改变结果。
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InvalidConfig(_) | Error::WrongType { .. } => false,
            Error::Kube(kube::Error::Api(resp)) => !matches!(resp.code, 400 | 422),
            Error::Kube(kube::Error::SerdeError(_)) => false,
            _ => true,
        }
    }

    /// 是否为"不存在"错误
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(e) => is_kube_not_found(e),
            _ => false,
        }
    }

    /// 是否为"已存在"错误
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::Kube(e) => is_kube_already_exists(e),
            _ => false,
        }
    }

    /// 是否为"多个值"错误
    pub fn is_multiple_values(&self) -> bool {
        matches!(self, Error::MultipleValues(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::wrong_type("JSON 文档", e.to_string())
    }
}

/// Kubernetes API 是否返回 404
pub fn is_kube_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

/// Kubernetes API 是否返回 409 AlreadyExists
pub fn is_kube_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}
