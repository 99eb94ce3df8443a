/// 自动瞄准 (Auto Aim)
///
/// 系统架构:
/// 1. 采集线程: 彩色 + 深度帧 → 单槽帧缓冲
/// 2. 检测线程: 检测 → 跟踪 → 选目标 → 三维坐标
/// 3. 链路线程: 下位机电报接收 / 瞄准指令发送
/// 4. 主线程:   主循环 (下行指令 + 显示)
///
/// 用法: sentinel [配置文件路径,默认 config/sentinel.json]
use std::path::PathBuf;

use auto_aim::{AutoAimConfig, AutoAimSystem, LogPresenter};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/sentinel.json";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    if let Some(dir) = config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    info!("🎯 自动瞄准系统");
    let config = AutoAimConfig::load(&config_path);
    config.log_summary();

    let mut system = AutoAimSystem::from_config(&config)?;
    let mut presenter = LogPresenter::new(config.app.presenter_log_every);
    let cycles = system.spin(&mut presenter);

    let stats = system.link().stats();
    info!(
        "📊 共{}个周期 | 电报 接收{} 丢弃{} | 指令发送{} | 重连{}次",
        cycles,
        stats.telegrams_accepted,
        stats.telegrams_dropped,
        stats.commands_sent,
        stats.reconnects
    );
    system.close();
    Ok(())
}
