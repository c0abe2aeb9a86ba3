//! 可选的日志输出安装入口（`telemetry` 特性）。
//!
//! 库本身只产出 `tracing` 事件；没有自己日志管线的宿主可以调用
//! [`install_fmt_subscriber`] 得到 `fmt + EnvFilter` 的标准输出。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 读取过滤规则的环境变量名，语法与 `RUST_LOG` 相同。
pub const LOG_ENV: &str = "BUFFLIB_LOG";

#[derive(Debug, Error)]
pub enum TelemetryError {
    /// 进程内已经存在全局 Subscriber。
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,

    #[error("failed to install tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装全局 Subscriber。
///
/// # 教案式说明
/// - **逻辑（How）**：先检查全局 Subscriber 是否已被设置，再用 `tracing-subscriber` 组装
///   `EnvFilter + fmt` 层；过滤规则取自 [`LOG_ENV`]，缺失或非法时退回 `info`；
/// - **契约（What）**：每个进程至多成功一次，之后的调用返回
///   [`TelemetryError::SubscriberAlreadySet`]。
pub fn install_fmt_subscriber() -> Result<(), TelemetryError> {
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}
