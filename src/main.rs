use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};

use vigil_core::{init_logging, AppConfig};
use vigil_domain::models::Rule;

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("vigil")
        .version("0.1.0")
        .about("分布式视频事件检测系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/vigil.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["orchestrator", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID (仅在worker模式下使用)"),
        )
        .arg(
            Arg::new("rules")
                .long("rules")
                .value_name("FILE")
                .help("检测规则文件路径 (JSON格式)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").cloned().unwrap_or_default();
    let mode_str = matches.get_one::<String>("mode").cloned().unwrap_or_default();
    let worker_id = matches.get_one::<String>("worker-id");
    let rules_path = matches.get_one::<String>("rules");
    let log_level = matches.get_one::<String>("log-level").cloned().unwrap_or_default();
    let log_format = matches.get_one::<String>("log-format").cloned().unwrap_or_default();

    init_logging(&log_level, &log_format)?;

    info!("启动分布式视频事件检测系统");
    info!("配置文件: {config_path}");
    info!("运行模式: {mode_str}");

    let mut config = AppConfig::load(Some(config_path.as_str()))
        .with_context(|| format!("加载配置文件失败: {config_path}"))?;

    // 命令行指定的worker-id覆盖配置
    if let Some(id) = worker_id {
        config.worker.worker_id = id.clone();
    }

    let rules = load_rules(rules_path.map(String::as_str))?;
    let app_mode = parse_app_mode(&mode_str, &config)?;
    let app = Application::new(config, app_mode, rules).await?;

    let app = std::sync::Arc::new(app);
    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let app = std::sync::Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    // SIGHUP触发规则文件重载，批次边界对在途流水线生效
    #[cfg(unix)]
    if let Some(path) = rules_path.cloned() {
        let app = std::sync::Arc::clone(&app);
        tokio::spawn(async move {
            match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(mut stream) => {
                    while stream.recv().await.is_some() {
                        match load_rules(Some(path.as_str())) {
                            Ok(rules) => app.swap_rules(rules),
                            Err(e) => error!("重新加载规则失败: {e}"),
                        }
                    }
                }
                Err(e) => error!("安装SIGHUP信号处理器失败: {e}"),
            }
        });
    }

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(result) => {
            if let Err(e) = result {
                error!("应用关闭时发生错误: {e}");
            } else {
                info!("应用已优雅关闭");
            }
        }
        Err(_) => {
            warn!("应用关闭超时，强制退出");
        }
    }

    info!("分布式视频事件检测系统已退出");
    Ok(())
}

/// 从JSON文件加载检测规则；未指定时返回空规则集
fn load_rules(path: Option<&str>) -> Result<Vec<Rule>> {
    let Some(path) = path else {
        warn!("未指定规则文件，以空规则集启动");
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("读取规则文件失败: {path}"))?;
    let rules: Vec<Rule> =
        serde_json::from_str(&raw).with_context(|| format!("解析规则文件失败: {path}"))?;
    info!(path, rules = rules.len(), "规则文件已加载");
    Ok(rules)
}

/// 解析应用运行模式
fn parse_app_mode(mode_str: &str, config: &AppConfig) -> Result<AppMode> {
    match mode_str {
        "orchestrator" => {
            if !config.orchestrator.enabled {
                return Err(anyhow::anyhow!("Orchestrator模式被禁用，请检查配置"));
            }
            Ok(AppMode::Orchestrator)
        }
        "worker" => {
            if !config.worker.enabled {
                return Err(anyhow::anyhow!("Worker模式被禁用，请检查配置"));
            }
            Ok(AppMode::Worker)
        }
        "all" => Ok(AppMode::All),
        _ => Err(anyhow::anyhow!("不支持的运行模式: {mode_str}")),
    }
}

/// 等待关闭信号 (Ctrl+C 或 SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("安装SIGTERM信号处理器失败: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
