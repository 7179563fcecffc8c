//! Agent 描述清单
//!
//! 每个 Agent 一个描述文件（TOML 或 JSON），放在配置目录下：
//! ```text
//! config/agents/
//! ├── forecast.toml
//! ├── inventory.toml
//! └── supply.json
//! ```
//! 文件按文件名排序加载，Agent 名必须全局唯一。

mod loader;

pub use loader::{load, parse_descriptor, AgentDescriptor, ConnectionSpec};
