//! 指标与健康检查模块
//!
//! 通过 HTTP 以 Prometheus 文本格式导出注册表中的指标，并提供存活探针端点。

use anyhow::{Context, Result};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tracing::{error, info};

/// 指标服务器
pub struct MetricsServer {
    /// Prometheus 注册表
    registry: Registry,
    /// 监听地址
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(registry: Registry, addr: SocketAddr) -> Self {
        Self { registry, addr }
    }

    /// 运行服务器，直到 `shutdown` 完成
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let registry = self.registry;
        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(handle(&registry, &req)) }
                }))
            }
        });

        let server = Server::try_bind(&self.addr)
            .with_context(|| format!("无法监听指标地址 {}", self.addr))?
            .serve(make_svc);
        info!("指标服务器监听于 {}", self.addr);

        server
            .with_graceful_shutdown(shutdown)
            .await
            .context("指标服务器异常退出")
    }
}

/// 处理单个请求
fn handle(registry: &Registry, req: &Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut buffer = vec![];
            if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                error!("编码指标失败: {}", e);
                return status(StatusCode::INTERNAL_SERVER_ERROR, "encode error");
            }

            let mut response = Response::new(Body::from(buffer));
            if let Ok(value) = encoder.format_type().parse() {
                response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
            }
            response
        }
        (&Method::GET, "/healthz") => status(StatusCode::OK, "ok"),
        _ => status(StatusCode::NOT_FOUND, "not found"),
    }
}

fn status(code: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = code;
    response
}
