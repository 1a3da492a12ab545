use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kube::CustomResourceExt;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flannel_operator::config::OperatorConfig;
use flannel_operator::crd::FlannelConfig;
use flannel_operator::version_bundle::version_bundles;
use flannel_operator::FlannelOperator;

#[derive(Parser, Debug)]
#[command(name = "flannel-operator")]
#[command(about = "Flannel Operator - 管理租户集群的 flannel 网络", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 运行 Operator
    Daemon(DaemonArgs),
    /// 打印 FlannelConfig CRD
    Crd,
    /// 打印版本包
    Version,
}

#[derive(Args, Debug)]
struct DaemonArgs {
    /// YAML/JSON 配置文件
    #[arg(long, env = "FLANNEL_OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// etcd 端点，逗号分隔
    #[arg(long, value_delimiter = ',')]
    etcd_endpoints: Vec<String>,

    /// FlannelConfig 标签选择器
    #[arg(long)]
    label_selector: Option<String>,

    /// 指标服务器端口
    #[arg(long)]
    metrics_port: Option<u16>,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,
}

impl DaemonArgs {
    /// 命令行参数覆盖配置文件与环境变量
    fn apply(&self, config: &mut OperatorConfig) {
        if !self.etcd_endpoints.is_empty() {
            config.etcd.endpoints = self.etcd_endpoints.clone();
        }
        if let Some(selector) = &self.label_selector {
            config.controller.label_selector = selector.clone();
        }
        if let Some(port) = self.metrics_port {
            config.metrics.port = port;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Daemon(args) => {
            let mut config = OperatorConfig::load(args.config.as_deref())?;
            args.apply(&mut config);
            config.validate()?;

            init_tracing(&config.log_level);
            run_daemon(config).await
        }
        Command::Crd => {
            let crd = serde_yaml::to_string(&FlannelConfig::crd()).context("序列化 CRD 失败")?;
            println!("{crd}");
            Ok(())
        }
        Command::Version => {
            let bundles = serde_json::to_string_pretty(&version_bundles()).context("序列化版本包失败")?;
            println!("{bundles}");
            Ok(())
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

async fn run_daemon(config: OperatorConfig) -> Result<()> {
    info!(
        etcd = ?config.etcd.endpoints,
        selector = %config.controller.label_selector,
        "启动 Flannel Operator"
    );

    let operator = FlannelOperator::new(config).await?;
    operator.start().await?;

    shutdown_signal().await?;

    operator.stop().await
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("注册 SIGTERM 处理失败")?;
    let mut sigint = signal(SignalKind::interrupt()).context("注册 SIGINT 处理失败")?;
    tokio::select! {
        _ = sigterm.recv() => info!("收到 SIGTERM"),
        _ = sigint.recv() => info!("收到 SIGINT"),
    }
    Ok(())
}
