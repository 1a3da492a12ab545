//! Flannel Operator - 将 FlannelConfig 资源协调为租户集群的 flannel 覆盖网络
//!
//! 每个 FlannelConfig 对应一个租户集群网络：Operator 在 etcd 中写入网络配置，
//! 创建网络命名空间、RBAC 绑定与 flanneld DaemonSet，并在对象删除时调度清理任务
//! 回收宿主机上的网桥。

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod etcd;
pub mod key;
pub mod metrics;
pub mod reconcile;
pub mod resource;
pub mod resource_set;
pub mod version_bundle;

use anyhow::{Context, Result};
use kube::Client;
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use flannel_controller::Engine;

use crate::cluster::ClusterClients;
use crate::config::OperatorConfig;
use crate::etcd::{EtcdV2Store, Store};
use crate::metrics::MetricsServer;
use crate::reconcile::Reconciler;
use crate::resource_set::{new_resource_routers, ResourceSetConfig};

/// 运行中的指标服务器
struct MetricsHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

/// Operator 主结构体
pub struct FlannelOperator {
    /// Operator 配置
    config: OperatorConfig,
    /// Prometheus 注册表
    registry: Registry,
    /// 控制器
    controller: Arc<RwLock<controller::Controller>>,
    /// 指标服务器
    metrics: RwLock<Option<MetricsHandle>>,
}

impl FlannelOperator {
    /// 创建新的 Operator 实例
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        config.validate()?;

        // 创建 Kubernetes 客户端
        let client = Client::try_default().await.context("创建 Kubernetes 客户端失败")?;
        let clients = ClusterClients::from_client(client.clone());

        let store: Arc<dyn Store> = Arc::new(
            EtcdV2Store::new(&config.etcd.endpoints, config.etcd.tls().as_ref())
                .context("创建 etcd 客户端失败")?,
        );

        let registry = Registry::new();
        let routers = new_resource_routers(
            &ResourceSetConfig {
                clients: clients.clone(),
                store,
                etcd: config.etcd.clone(),
                retry: config.retry.policy(),
                teardown: config.retry.teardown_policy(),
            },
            &registry,
        )?;
        let engine = Engine::new(routers)?.with_registry(&registry)?;

        let reconciler = Arc::new(Reconciler::new(
            engine,
            clients.flannel_configs.clone(),
            config.controller.clone(),
        ));
        let controller = Arc::new(RwLock::new(controller::Controller::new(
            client,
            reconciler,
            &config.controller.label_selector,
        )));

        Ok(Self {
            config,
            registry,
            controller,
            metrics: RwLock::new(None),
        })
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        let addr = self.config.metrics.socket_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let server = MetricsServer::new(self.registry.clone(), addr);
        let task = tokio::spawn(server.serve(async move {
            let _ = shutdown_rx.await;
        }));
        *self.metrics.write().await = Some(MetricsHandle { shutdown, task });

        // 启动控制器
        self.controller.write().await.start().await?;

        info!("Flannel Operator 已启动");
        Ok(())
    }

    /// 停止 Operator
    pub async fn stop(&self) -> Result<()> {
        // 停止控制器
        self.controller.write().await.stop().await?;

        if let Some(handle) = self.metrics.write().await.take() {
            let _ = handle.shutdown.send(());
            match handle.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("指标服务器退出时出错: {:#}", e),
                Err(e) => warn!("指标服务器任务异常: {}", e),
            }
        }

        info!("Flannel Operator 已停止");
        Ok(())
    }

    /// Operator 配置
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }
}
