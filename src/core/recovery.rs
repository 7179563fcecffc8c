//! 错误恢复引擎
//!
//! 根据 HiveError 类型返回 RecoveryAction：单次调用级错误转为 Observation 让决策后端自我修正，
//! 其余错误终止当前查询。

use crate::core::{HiveError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（反馈 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// available 为当前注册表中的能力名，用于 UnknownCapability 时提示决策后端
    pub fn handle(&self, err: &HiveError, available: &[String]) -> RecoveryAction {
        match err {
            HiveError::UnknownCapability(name) => RecoveryAction::Observe(format!(
                "Capability '{name}' does not exist. Only use one of: {}.",
                available.join(", ")
            )),
            HiveError::InvalidArguments { capability, message } => RecoveryAction::Observe(
                format!("Arguments rejected for '{capability}': {message}. Fix the arguments to match its input schema."),
            ),
            HiveError::AgentUnavailable { agent, reason } => RecoveryAction::Observe(format!(
                "Agent '{agent}' is unavailable ({reason}). Try another capability or answer with what you have."
            )),
            HiveError::CapabilityExecution { capability, message } => {
                RecoveryAction::Observe(format!("Error from {capability}: {message}"))
            }
            _ => RecoveryAction::Abort,
        }
    }
}
