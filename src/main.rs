//! chatbridge 入口
//!
//! 初始化日志与配置，装配桥接（默认控制台传输），运行到 Ctrl+C / SIGTERM。
//! 用法：`chatbridge [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chatbridge::connection::SupervisorExit;
use chatbridge::core::{create_bridge_builder, ShutdownManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chatbridge::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let bridge = create_bridge_builder(config_path)
        .context("Failed to load configuration")?
        .build();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let exit = bridge
        .run(shutdown.token())
        .await
        .context("Bridge run failed")?;

    if let Some(reason) = shutdown.reason() {
        tracing::info!("Shutdown requested: {:?}", reason);
    }
    match exit {
        SupervisorExit::Shutdown => tracing::info!("Shut down cleanly"),
        SupervisorExit::Fatal(reason) => tracing::warn!("Exited after fatal disconnect: {}", reason),
    }
    Ok(())
}
