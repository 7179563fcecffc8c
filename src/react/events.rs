//! 编排过程事件：用于 CLI / Web 实时展示决策、调用与观察

use serde::Serialize;
use uuid::Uuid;

use crate::trace::{ReasoningStep, ToolStep, TraceStatus};

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted { run_id: Uuid, query: String },
    /// 第几轮决策（从 1 开始）
    CycleStarted { cycle: usize, max_cycles: usize },
    Reasoning { step: ReasoningStep },
    /// 调用前：记忆回填了哪些参数
    ArgumentsBackfilled {
        capability: String,
        keys: Vec<String>,
    },
    ToolStarted {
        capability: String,
        agent: Option<String>,
        arguments: serde_json::Value,
    },
    ToolFinished { step: ToolStep },
    Finished { run_id: Uuid, outcome: TraceStatus },
}
