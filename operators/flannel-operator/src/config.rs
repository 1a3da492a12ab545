//! 配置管理模块
//!
//! 该模块负责加载 Operator 的配置：内置默认值、可选的 YAML/JSON 配置文件，
//! 以及 `FLANNEL_OPERATOR__*` 环境变量，后者优先级最高。

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flannel_controller::BackoffPolicy;

use crate::etcd::EtcdTls;

/// 环境变量前缀
const ENV_PREFIX: &str = "FLANNEL_OPERATOR";

/// 环境变量层级分隔符
const ENV_SEPARATOR: &str = "__";

/// Operator 配置结构
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorConfig {
    /// etcd 配置
    pub etcd: EtcdConfig,
    /// 控制器配置
    pub controller: ControllerConfig,
    /// 重试配置
    pub retry: RetryConfig,
    /// 指标服务器配置
    pub metrics: MetricsConfig,
    /// 日志级别，`RUST_LOG` 未设置时生效
    pub log_level: String,
}

/// etcd 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EtcdConfig {
    /// Operator 连接的 etcd 端点
    pub endpoints: Vec<String>,
    /// CA 证书路径，同时传给 flanneld
    pub ca_file: String,
    /// 客户端证书路径
    pub crt_file: String,
    /// 客户端私钥路径
    pub key_file: String,
}

/// 控制器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// FlannelConfig 标签选择器，为空时监听全部对象
    pub label_selector: String,
    /// 存活对象的重新协调周期（秒）
    pub resync_seconds: u64,
    /// 协调失败后的重新入队间隔（秒）
    pub error_requeue_seconds: u64,
    /// 取消或保留 finalizer 后的重新入队间隔（秒）
    pub short_requeue_seconds: u64,
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// 首次重试间隔（毫秒）
    pub initial_interval_ms: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 间隔增长倍数
    pub multiplier: f64,
    /// 处理器操作的最长重试时间（秒）
    pub max_elapsed_seconds: u64,
    /// 清理任务的最长等待时间（秒）
    pub teardown_max_elapsed_seconds: u64,
}

/// 指标服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub port: u16,
}

impl OperatorConfig {
    /// 加载配置，`path` 为空时只使用默认值与环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// 加载配置，`env` 不为空时代替进程环境变量
    pub fn load_with_env(path: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let defaults = Config::try_from(&create_default_config()).context("构建默认配置失败")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

            // 确定配置文件格式
            let format = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => FileFormat::Yaml,
                Some("json") => FileFormat::Json,
                _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
            };
            builder = builder.add_source(File::with_name(config_file).format(format));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .list_separator(",")
                .with_list_parse_key("etcd.endpoints")
                .try_parsing(true)
                .source(env),
        );

        let config = builder
            .build()
            .with_context(|| format!("无法加载配置文件: {:?}", path.map(PathBuf::from)))?;
        let operator_config = config
            .try_deserialize::<OperatorConfig>()
            .context("配置格式错误")?;

        operator_config.validate()?;
        Ok(operator_config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.etcd.endpoints.is_empty() {
            return Err(flannel_common::Error::InvalidConfig("etcd.endpoints 不能为空".into()).into());
        }
        for (field, value) in [
            ("etcd.ca_file", &self.etcd.ca_file),
            ("etcd.crt_file", &self.etcd.crt_file),
            ("etcd.key_file", &self.etcd.key_file),
        ] {
            if value.is_empty() {
                return Err(flannel_common::Error::InvalidConfig(format!("{field} 不能为空")).into());
            }
        }
        if self.controller.resync_seconds == 0 || self.controller.short_requeue_seconds == 0 {
            return Err(flannel_common::Error::InvalidConfig("重新入队间隔必须大于 0".into()).into());
        }

        self.retry.policy().validate()?;
        self.retry.teardown_policy().validate()?;
        self.metrics.socket_addr()?;
        Ok(())
    }
}

impl EtcdConfig {
    /// Operator 自身连接 etcd 使用的证书
    pub fn tls(&self) -> Option<EtcdTls> {
        if self.crt_file.is_empty() || self.key_file.is_empty() {
            return None;
        }
        Some(EtcdTls {
            ca_file: (!self.ca_file.is_empty()).then(|| PathBuf::from(&self.ca_file)),
            crt_file: PathBuf::from(&self.crt_file),
            key_file: PathBuf::from(&self.key_file),
        })
    }
}

impl ControllerConfig {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_seconds)
    }

    pub fn short_requeue(&self) -> Duration {
        Duration::from_secs(self.short_requeue_seconds)
    }
}

impl RetryConfig {
    /// 处理器操作的退避策略
    pub fn policy(&self) -> BackoffPolicy {
        self.with_max_elapsed(self.max_elapsed_seconds)
    }

    /// 清理任务的退避策略
    pub fn teardown_policy(&self) -> BackoffPolicy {
        self.with_max_elapsed(self.teardown_max_elapsed_seconds)
    }

    fn with_max_elapsed(&self, seconds: u64) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_secs(self.max_interval_seconds),
            multiplier: self.multiplier,
            max_elapsed_time: Duration::from_secs(seconds),
        }
    }
}

impl MetricsConfig {
    /// 监听的套接字地址
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_address, self.port)
            .parse()
            .with_context(|| format!("指标监听地址无效: {}", self.listen_address))
    }
}

/// 创建默认配置
pub fn create_default_config() -> OperatorConfig {
    OperatorConfig {
        etcd: EtcdConfig {
            endpoints: vec!["https://127.0.0.1:2379".to_string()],
            ca_file: "/etc/kubernetes/ssl/etcd/client-ca.pem".to_string(),
            crt_file: "/etc/kubernetes/ssl/etcd/client-crt.pem".to_string(),
            key_file: "/etc/kubernetes/ssl/etcd/client-key.pem".to_string(),
        },
        controller: ControllerConfig {
            label_selector: String::new(),
            resync_seconds: 300,
            error_requeue_seconds: 30,
            short_requeue_seconds: 10,
        },
        retry: RetryConfig {
            initial_interval_ms: 500,
            max_interval_seconds: 60,
            multiplier: 1.5,
            max_elapsed_seconds: 5 * 60,
            teardown_max_elapsed_seconds: 15 * 60,
        },
        metrics: MetricsConfig {
            listen_address: "0.0.0.0".to_string(),
            port: 8000,
        },
        log_level: "info".to_string(),
    }
}
