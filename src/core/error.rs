//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：单次调用级错误（AgentUnavailable / UnknownCapability / CapabilityExecution /
//! InvalidArguments）写入 Trace 并反馈给决策后端；查询级错误（DecisionProtocol / LoopBoundExceeded /
//! Cancelled / DeadlineExceeded）终止当前查询；Configuration 在启动时终止整个服务。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Agent '{agent}' unavailable: {reason}")]
    AgentUnavailable { agent: String, reason: String },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Capability '{capability}' failed: {message}")]
    CapabilityExecution { capability: String, message: String },

    /// 参数未通过能力声明的 input schema 校验
    #[error("Invalid arguments for '{capability}': {message}")]
    InvalidArguments { capability: String, message: String },

    /// 决策后端输出无法解析为「最终回答」或「调用能力 + 参数」
    #[error("Decision protocol error: {0}")]
    DecisionProtocol(String),

    #[error("Loop bound exceeded after {0} cycles")]
    LoopBoundExceeded(usize),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Query deadline exceeded")]
    DeadlineExceeded,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Memory error: {0}")]
    Memory(String),

    /// 轨迹等本地文件写入失败
    #[error("Storage error: {0}")]
    Storage(String),

    /// Trace 追加顺序被破坏（Reasoning / Tool 交替约束）
    #[error("Trace violation: {0}")]
    TraceViolation(String),
}

/// 可序列化的错误类别，作为 Trace 与 QueryFailure 中的失败标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    AgentUnavailable,
    UnknownCapability,
    CapabilityExecution,
    InvalidArguments,
    DecisionProtocol,
    LoopBoundExceeded,
    Cancelled,
    DeadlineExceeded,
    Llm,
    Memory,
    Internal,
}

impl HiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HiveError::Configuration(_) => ErrorKind::Configuration,
            HiveError::AgentUnavailable { .. } => ErrorKind::AgentUnavailable,
            HiveError::UnknownCapability(_) => ErrorKind::UnknownCapability,
            HiveError::CapabilityExecution { .. } => ErrorKind::CapabilityExecution,
            HiveError::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            HiveError::DecisionProtocol(_) => ErrorKind::DecisionProtocol,
            HiveError::LoopBoundExceeded(_) => ErrorKind::LoopBoundExceeded,
            HiveError::Cancelled => ErrorKind::Cancelled,
            HiveError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            HiveError::Llm(_) => ErrorKind::Llm,
            HiveError::Memory(_) => ErrorKind::Memory,
            HiveError::Storage(_) | HiveError::TraceViolation(_) => ErrorKind::Internal,
        }
    }

    pub fn agent_unavailable(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        HiveError::AgentUnavailable {
            agent: agent.into(),
            reason: reason.into(),
        }
    }

    pub fn execution(capability: impl Into<String>, message: impl Into<String>) -> Self {
        HiveError::CapabilityExecution {
            capability: capability.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::AgentUnavailable => "agent_unavailable",
            ErrorKind::UnknownCapability => "unknown_capability",
            ErrorKind::CapabilityExecution => "capability_execution",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::DecisionProtocol => "decision_protocol",
            ErrorKind::LoopBoundExceeded => "loop_bound_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Llm => "llm",
            ErrorKind::Memory => "memory",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 作为 Observation 写回上下文，让决策后端自行修正
    Observe(String),
    /// 终止当前查询（保留部分 Trace）
    Abort,
}
