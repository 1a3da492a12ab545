//! etcd v2 客户端
//!
//! 通过 etcd v2 keys HTTP API 访问配置存储，支持双向 TLS 与多个端点。

use async_trait::async_trait;
use reqwest::{Certificate, Identity, Method};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use flannel_common::{Error, Result};

use super::{normalize_key, Store};

/// etcd v2 错误码：键不存在
const ERROR_CODE_KEY_NOT_FOUND: u32 = 100;
/// etcd v2 错误码：键已存在
const ERROR_CODE_NODE_EXIST: u32 = 105;

/// etcd 客户端证书
#[derive(Debug, Clone, PartialEq)]
pub struct EtcdTls {
    /// CA 证书，为空时使用系统根证书
    pub ca_file: Option<PathBuf>,
    /// 客户端证书
    pub crt_file: PathBuf,
    /// 客户端私钥
    pub key_file: PathBuf,
}

/// etcd v2 存储
#[derive(Debug)]
pub struct EtcdV2Store {
    client: reqwest::Client,
    endpoints: Vec<Url>,
}

/// etcd v2 成功响应
#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: Option<Node>,
}

/// etcd v2 节点
#[derive(Debug, Default, Deserialize)]
struct Node {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<Node>,
}

/// etcd v2 错误响应
#[derive(Debug, Deserialize)]
struct EtcdError {
    #[serde(rename = "errorCode")]
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

impl EtcdV2Store {
    /// 创建客户端
    pub fn new(endpoints: &[String], tls: Option<&EtcdTls>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::InvalidConfig("etcd 端点不能为空".into()));
        }

        let endpoints = endpoints
            .iter()
            .map(|e| {
                Url::parse(e).map_err(|err| Error::InvalidConfig(format!("etcd 端点无效 {e}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30));

        if let Some(tls) = tls {
            if let Some(ca_file) = &tls.ca_file {
                let ca = read_file(ca_file)?;
                let cert = Certificate::from_pem(&ca)
                    .map_err(|e| Error::InvalidConfig(format!("etcd CA 证书无效: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }

            let mut pem = read_file(&tls.crt_file)?;
            pem.extend(read_file(&tls.key_file)?);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| Error::InvalidConfig(format!("etcd 客户端证书无效: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| Error::InvalidConfig(format!("创建 etcd 客户端失败: {e}")))?;

        Ok(Self { client, endpoints })
    }

    /// 依次尝试每个端点，连接失败时换下一个
    async fn request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        form: Option<&[(&str, &str)]>,
    ) -> Result<Node> {
        let key = normalize_key(key);
        let mut last_error = None;

        for endpoint in &self.endpoints {
            let url = endpoint
                .join(&format!("v2/keys/{key}"))
                .map_err(|e| Error::InvalidConfig(format!("etcd 路径无效 {key}: {e}")))?;

            let mut request = self.client.request(method.clone(), url).query(query);
            if let Some(form) = form {
                request = request.form(form);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("etcd 端点 {} 不可用: {}", endpoint, e);
                    last_error = Some(Error::Etcd(e.to_string()));
                    continue;
                }
                Err(e) => return Err(Error::Etcd(e.to_string())),
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| Error::Etcd(format!("读取 etcd 响应失败: {e}")))?;
            debug!("etcd {} {} -> {}", method, key, status);

            return decode_response(status.as_u16(), &body, &key);
        }

        Err(last_error.unwrap_or_else(|| Error::Etcd("没有可用的 etcd 端点".into())))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::InvalidConfig(format!("读取证书文件 {:?} 失败: {e}", path)))
}

/// 解析 etcd v2 响应
fn decode_response(status: u16, body: &str, key: &str) -> Result<Node> {
    if (200..300).contains(&status) {
        let response: EtcdResponse = serde_json::from_str(body)?;
        return Ok(response.node.unwrap_or_default());
    }

    let error: EtcdError = serde_json::from_str(body)
        .map_err(|_| Error::Etcd(format!("etcd 返回 {status}: {body}")))?;
    match error.error_code {
        ERROR_CODE_KEY_NOT_FOUND => Err(Error::NotFound(key.to_string())),
        ERROR_CODE_NODE_EXIST => Err(Error::AlreadyExists(key.to_string())),
        code => Err(Error::Etcd(format!(
            "etcd 错误 {code}: {} ({})",
            error.message,
            error.cause.unwrap_or_default()
        ))),
    }
}

/// 从节点中取出唯一的值
fn single_value(node: Node, key: &str) -> Result<String> {
    if !node.dir {
        return node.value.ok_or_else(|| Error::NotFound(key.to_string()));
    }

    let mut values: Vec<String> = node.nodes.into_iter().filter_map(|n| n.value).collect();
    match values.len() {
        0 => Err(Error::NotFound(key.to_string())),
        1 => Ok(values.remove(0)),
        _ => Err(Error::MultipleValues(key.to_string())),
    }
}

#[async_trait]
impl Store for EtcdV2Store {
    async fn create(&self, key: &str, value: &str) -> Result<()> {
        self.request(
            Method::PUT,
            key,
            &[("prevExist", "false")],
            Some(&[("value", value)][..]),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.request(Method::DELETE, key, &[("recursive", "true")], None)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.request(Method::GET, key, &[], None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, key: &str) -> Result<Vec<String>> {
        let node = self.request(Method::GET, key, &[], None).await?;
        Ok(node.nodes.into_iter().filter_map(|n| n.value).collect())
    }

    async fn search(&self, key: &str) -> Result<String> {
        let node = self.request(Method::GET, key, &[], None).await?;
        single_value(node, &normalize_key(key))
    }
}
