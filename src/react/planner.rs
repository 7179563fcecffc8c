//! Planner：决策后端与决策解析
//!
//! 决策后端给定（系统提示、历史回合、能力菜单），返回「最终回答」或「调用能力 + 参数」。
//! Planner 基于 LlmClient 实现该契约，使用受约束的 JSON 输出：
//! `{"thought": "...", "tool": "name", "args": {...}}` 或 `{"thought": "...", "answer": "..."}`。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::core::HiveError;
use crate::llm::{LlmClient, Message};
use crate::registry::Capability;

/// 一次决策的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Answer {
        rationale: String,
        text: String,
    },
    Invoke {
        rationale: String,
        capability: String,
        arguments: Value,
    },
}

/// 决策请求：system 已包含能力菜单与 Agent 描述；menu 供结构化后端直接使用
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub system: &'a str,
    pub turns: &'a [Message],
    pub menu: &'a [Capability],
}

#[async_trait]
pub trait DecisionBackend: Send + Sync {
    /// 输出不符合契约时返回 HiveError::DecisionProtocol
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, HiveError>;

    /// 累计 token 使用：(prompt, completion, total)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 决策输出格式（仅用于生成 Schema 与解析）
#[derive(Debug, Deserialize, JsonSchema)]
struct DecisionFormat {
    /// 本步推理
    #[serde(default)]
    thought: Option<String>,
    /// 要调用的能力名；与 answer 二选一
    #[serde(default)]
    tool: Option<String>,
    /// 能力参数，须符合该能力的 parameters schema
    #[serde(default)]
    args: Option<HashMap<String, Value>>,
    /// 最终回答；与 tool 二选一
    #[serde(default)]
    answer: Option<String>,
}

/// 决策格式的 JSON Schema 字符串，拼入 system prompt
pub fn decision_format_schema_json() -> String {
    let schema = schema_for!(DecisionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 从文本中取出 JSON 对象：```json 代码块，或第一个 `{` 到最后一个 `}`
fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 解析模型输出：
/// - 不含 JSON：整段文本作为最终回答
/// - JSON 无法解析、同时给出 tool 与 answer、两者都没有：DecisionProtocol
pub fn parse_decision(output: &str) -> Result<Decision, HiveError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(HiveError::DecisionProtocol("empty decision".into()));
    }

    let Some(json_str) = extract_json(trimmed) else {
        return Ok(Decision::Answer {
            rationale: String::new(),
            text: trimmed.to_string(),
        });
    };

    let parsed: DecisionFormat = serde_json::from_str(json_str)
        .map_err(|e| HiveError::DecisionProtocol(format!("{e}: {}", preview(json_str))))?;

    let rationale = parsed.thought.unwrap_or_default();
    let tool = parsed.tool.filter(|t| !t.trim().is_empty());
    let answer = parsed.answer.filter(|a| !a.trim().is_empty());

    match (tool, answer) {
        (Some(_), Some(_)) => Err(HiveError::DecisionProtocol(
            "decision contains both 'tool' and 'answer'".into(),
        )),
        (Some(tool), None) => Ok(Decision::Invoke {
            rationale,
            capability: tool.trim().to_string(),
            arguments: Value::Object(parsed.args.unwrap_or_default().into_iter().collect()),
        }),
        (None, Some(text)) => Ok(Decision::Answer { rationale, text }),
        (None, None) => Err(HiveError::DecisionProtocol(format!(
            "decision has neither 'tool' nor 'answer': {}",
            preview(json_str)
        ))),
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Planner：持有 LLM，拼 system + turns 后调用并解析
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl DecisionBackend for Planner {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, HiveError> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        messages.push(Message::system(request.system));
        messages.extend_from_slice(request.turns);
        let output = self.llm.complete(&messages).await?;
        tracing::debug!(output = %preview(&output), "Planner output");
        parse_decision(&output)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}
