//! 可观测性：tracing 订阅器初始化
//!
//! 日志一律写 stderr，stdout 留给回答输出（以及 stdio Agent 的协议帧）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogSection;

/// RUST_LOG 优先，其次使用 level；json 为 true 时输出结构化日志
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

pub fn init_from_config(log: &LogSection) {
    init(&log.level, log.json);
}
