//! 控制器模块
//!
//! 该模块在 kube-runtime 控制器上运行 FlannelConfig 的协调循环。同一对象的协调由
//! 运行时队列串行执行，不同对象之间并发。

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    client::Client,
    runtime::{controller::Controller as KubeController, watcher},
};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crd::FlannelConfig;
use crate::reconcile::Reconciler;

/// 控制器结构体
pub struct Controller {
    /// Kubernetes 客户端
    client: Client,
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// FlannelConfig 标签选择器
    label_selector: String,
    /// 控制器是否正在运行
    running: Arc<RwLock<bool>>,
    /// 停止信号
    shutdown: Option<watch::Sender<bool>>,
    /// 协调循环任务
    task: Option<JoinHandle<()>>,
}

impl Controller {
    /// 创建新的控制器
    pub fn new(client: Client, reconciler: Arc<Reconciler>, label_selector: &str) -> Self {
        Self {
            client,
            reconciler,
            label_selector: label_selector.to_string(),
            running: Arc::new(RwLock::new(false)),
            shutdown: None,
            task: None,
        }
    }

    /// 启动控制器
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(anyhow!("控制器已在运行"));
            }
            *running = true;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let flannel_configs: Api<FlannelConfig> = Api::all(self.client.clone());

        let mut watcher_config = watcher::Config::default();
        if !self.label_selector.is_empty() {
            watcher_config = watcher_config.labels(&self.label_selector);
        }

        let reconciler = self.reconciler.clone();
        let running = self.running.clone();
        let task = tokio::spawn(async move {
            KubeController::new(flannel_configs, watcher_config)
                .graceful_shutdown_on(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .run(
                    |obj, ctx: Arc<Reconciler>| async move { ctx.reconcile(obj).await },
                    |obj, error, ctx: Arc<Reconciler>| ctx.handle_error(obj, error),
                    reconciler,
                )
                .for_each(|result| async move {
                    match result {
                        Ok((obj, action)) => debug!(object = %obj, ?action, "协调成功"),
                        Err(e) => warn!("协调错误: {}", e),
                    }
                })
                .await;

            *running.write().await = false;
            info!("FlannelConfig 控制器已退出");
        });

        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        info!(selector = %self.label_selector, "FlannelConfig 控制器已启动");

        Ok(())
    }

    /// 停止控制器，等待进行中的协调结束
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| anyhow!("控制器任务异常退出: {e}"))?;
        }

        *self.running.write().await = false;
        info!("FlannelConfig 控制器已停止");

        Ok(())
    }

    /// 控制器是否正在运行
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// 获取协调器
    pub fn get_reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }
}
