//! 可观测性：tracing 订阅者初始化
//!
//! 默认级别 info，RUST_LOG 可覆盖（如 `RUST_LOG=hive=debug`）。日志写到 stderr，
//! stdout 留给事件流输出。重复初始化（如多个测试）时静默忽略。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
