//! 单次编排运行的轨迹
//!
//! Reasoning / Tool 两类条目共用一个从 1 开始的步骤序号；Tool 条目必须紧跟一个选择了调用的 Reasoning 条目。
//! finish() 消耗 TraceRecorder，返回不可变的 Trace。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{ErrorKind, HiveError};

/// 决策后端一次输出对应的动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// 最终回答
    Answer { text: String },
    /// 调用能力
    Invoke { capability: String, arguments: Value },
    /// 输出无法解析，查询终止
    Rejected { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub step: usize,
    pub rationale: String,
    pub action: Action,
}

impl ReasoningStep {
    /// step 由 TraceRecorder 分配
    pub fn new(rationale: impl Into<String>, action: Action) -> Self {
        Self {
            step: 0,
            rationale: rationale.into(),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok { result: String },
    Error { kind: ErrorKind, message: String },
}

impl ToolOutcome {
    pub fn from_error(err: &HiveError) -> Self {
        ToolOutcome::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok { .. })
    }

    /// 写回对话上下文的文本
    pub fn text(&self) -> &str {
        match self {
            ToolOutcome::Ok { result } => result,
            ToolOutcome::Error { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    pub step: usize,
    pub capability: String,
    /// 能力未注册时为 None
    pub agent: Option<String>,
    /// 实际下发的参数（回填之后）
    pub arguments: Value,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ToolStep {
    pub fn new(
        capability: impl Into<String>,
        agent: Option<String>,
        arguments: Value,
        outcome: ToolOutcome,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            step: 0,
            capability: capability.into(),
            agent,
            arguments,
            outcome,
            started_at,
            ended_at,
            duration_ms,
        }
    }
}

/// 扁平化的轨迹条目，序列化为 {"type": "reasoning" | "tool", ...}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEntry {
    Reasoning(ReasoningStep),
    Tool(ToolStep),
}

impl TraceEntry {
    pub fn step(&self) -> usize {
        match self {
            TraceEntry::Reasoning(r) => r.step,
            TraceEntry::Tool(t) => t.step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TraceStatus {
    Completed,
    Failed { kind: ErrorKind, message: String },
}

/// 完成后的轨迹（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub run_id: Uuid,
    pub query: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: TraceStatus,
    pub entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn reasoning_steps(&self) -> impl Iterator<Item = &ReasoningStep> {
        self.entries.iter().filter_map(|e| match e {
            TraceEntry::Reasoning(r) => Some(r),
            _ => None,
        })
    }

    pub fn tool_steps(&self) -> impl Iterator<Item = &ToolStep> {
        self.entries.iter().filter_map(|e| match e {
            TraceEntry::Tool(t) => Some(t),
            _ => None,
        })
    }

    pub fn final_answer(&self) -> Option<&str> {
        match self.entries.last() {
            Some(TraceEntry::Reasoning(ReasoningStep {
                action: Action::Answer { text },
                ..
            })) => Some(text),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == TraceStatus::Completed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 追加式记录器，每次运行一个
#[derive(Debug)]
pub struct TraceRecorder {
    run_id: Uuid,
    query: String,
    user_id: String,
    started_at: DateTime<Utc>,
    entries: Vec<TraceEntry>,
    closed: bool,
}

impl TraceRecorder {
    pub fn new(query: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            query: query.into(),
            user_id: user_id.into(),
            started_at: Utc::now(),
            entries: Vec::new(),
            closed: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    fn next_step(&self) -> usize {
        self.entries.len() + 1
    }

    /// 追加 Reasoning 条目，返回分配的步骤号；最终回答或被拒绝的决策之后不再接受新条目
    pub fn record_reasoning(&mut self, mut step: ReasoningStep) -> Result<usize, HiveError> {
        if self.closed {
            return Err(HiveError::TraceViolation(
                "reasoning step recorded after a terminal decision".into(),
            ));
        }
        step.step = self.next_step();
        self.closed = !matches!(step.action, Action::Invoke { .. });
        let n = step.step;
        self.entries.push(TraceEntry::Reasoning(step));
        Ok(n)
    }

    /// 追加 Tool 条目：上一条必须是选择了调用的 Reasoning 条目
    pub fn record_tool(&mut self, mut step: ToolStep) -> Result<usize, HiveError> {
        let follows_invoke = matches!(
            self.entries.last(),
            Some(TraceEntry::Reasoning(ReasoningStep {
                action: Action::Invoke { .. },
                ..
            }))
        );
        if !follows_invoke {
            return Err(HiveError::TraceViolation(format!(
                "tool step '{}' does not follow an invoke decision",
                step.capability
            )));
        }
        step.step = self.next_step();
        let n = step.step;
        self.entries.push(TraceEntry::Tool(step));
        Ok(n)
    }

    pub fn finish(self, outcome: TraceStatus) -> Trace {
        Trace {
            run_id: self.run_id,
            query: self.query,
            user_id: self.user_id,
            started_at: self.started_at,
            ended_at: Utc::now(),
            outcome,
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoke(cap: &str) -> ReasoningStep {
        ReasoningStep::new(
            format!("need {cap}"),
            Action::Invoke {
                capability: cap.to_string(),
                arguments: json!({}),
            },
        )
    }

    fn tool(cap: &str) -> ToolStep {
        let now = Utc::now();
        ToolStep::new(
            cap,
            Some("sales".into()),
            json!({}),
            ToolOutcome::Ok { result: "42".into() },
            now,
            now,
        )
    }

    #[test]
    fn test_steps_are_sequential() {
        let mut rec = TraceRecorder::new("q", "u");
        assert_eq!(rec.record_reasoning(invoke("a")).unwrap(), 1);
        assert_eq!(rec.record_tool(tool("a")).unwrap(), 2);
        assert_eq!(
            rec.record_reasoning(ReasoningStep::new("done", Action::Answer { text: "42".into() }))
                .unwrap(),
            3
        );
        let trace = rec.finish(TraceStatus::Completed);
        assert_eq!(trace.reasoning_steps().count(), 2);
        assert_eq!(trace.tool_steps().count(), 1);
        assert_eq!(trace.final_answer(), Some("42"));
    }

    #[test]
    fn test_tool_without_invoke_rejected() {
        let mut rec = TraceRecorder::new("q", "u");
        assert!(matches!(
            rec.record_tool(tool("a")),
            Err(HiveError::TraceViolation(_))
        ));
        rec.record_reasoning(invoke("a")).unwrap();
        rec.record_tool(tool("a")).unwrap();
        // 同一决策后只能有一个 Tool 条目
        assert!(rec.record_tool(tool("a")).is_err());
    }

    #[test]
    fn test_nothing_after_terminal_answer() {
        let mut rec = TraceRecorder::new("q", "u");
        rec.record_reasoning(ReasoningStep::new("", Action::Answer { text: "hi".into() }))
            .unwrap();
        assert!(rec.record_reasoning(invoke("a")).is_err());
    }

    #[test]
    fn test_serializes_to_flat_typed_records() {
        let mut rec = TraceRecorder::new("q", "u");
        rec.record_reasoning(invoke("total_sales")).unwrap();
        rec.record_tool(tool("total_sales")).unwrap();
        let trace = rec.finish(TraceStatus::Failed {
            kind: ErrorKind::LoopBoundExceeded,
            message: "Loop bound exceeded after 1 cycles".into(),
        });

        let v = serde_json::to_value(&trace).unwrap();
        assert_eq!(v["outcome"]["status"], "failed");
        assert_eq!(v["outcome"]["kind"], "loop_bound_exceeded");
        assert_eq!(v["entries"][0]["type"], "reasoning");
        assert_eq!(v["entries"][0]["action"]["kind"], "invoke");
        assert_eq!(v["entries"][1]["type"], "tool");
        assert_eq!(v["entries"][1]["status"], "ok");
        assert_eq!(v["entries"][1]["result"], "42");
        assert_eq!(v["entries"][1]["agent"], "sales");

        let back: Trace = serde_json::from_value(v).unwrap();
        assert_eq!(back.len(), 2);
    }
}
