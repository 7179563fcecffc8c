//! Hive - 多 Agent 编排引擎
//!
//! 一个 ReAct 风格的协调器：由决策后端（LLM）在每一轮选择「直接回答」或「调用某个能力」，
//! 能力由若干独立进程 / 服务中的 Agent 提供，统一汇总到能力注册表。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、优雅关闭、运行时组装
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Azure / DeepSeek / Mock）
//! - **manifest**: Agent 描述清单加载
//! - **memory**: 按用户的持久记忆与参数回填
//! - **observability**: 日志初始化
//! - **react**: 决策后端、提示构建、ReAct 主循环
//! - **registry**: 能力注册表与参数 schema 校验
//! - **session**: Agent 会话（stdio / HTTP JSON-RPC）与会话管理
//! - **trace**: 每次查询的推理 / 工具轨迹与持久化

pub mod config;
pub mod core;
pub mod llm;
pub mod manifest;
pub mod memory;
pub mod observability;
pub mod react;
pub mod registry;
pub mod session;
pub mod trace;

pub use crate::core::{Hive, HiveBuilder, HiveError};
pub use crate::react::{Orchestrator, QueryFailure, QueryOutcome, RunOptions};
pub use crate::trace::Trace;
