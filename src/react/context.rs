//! 决策上下文：系统提示拼装、回合渲染、可插拔预分类器
//!
//! 系统提示 = 基础提示 + Agent 列表 + 能力菜单 + 决策格式 Schema + 用户记忆 + 预分类提示。

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::config::HintRule;
use crate::core::HiveError;
use crate::manifest::AgentDescriptor;
use crate::react::planner::decision_format_schema_json;
use crate::registry::CapabilityRegistry;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Hive, an orchestrator that answers questions by delegating work to specialist agents. \
Call one capability at a time, read its observation, and give the final answer once you have enough information.";

/// 预分类器：从查询文本推断提示，注入系统提示；不参与路由决策
pub trait Preclassifier: Send + Sync {
    fn hints(&self, query: &str) -> Vec<String>;
}

/// 正则规则预分类器（忽略大小写）
#[derive(Debug, Clone)]
pub struct PatternPreclassifier {
    rules: Vec<(Regex, String)>,
}

impl PatternPreclassifier {
    /// 规则中任一正则无效时返回 Configuration 错误
    pub fn new(rules: &[HintRule]) -> Result<Self, HiveError> {
        let rules = rules
            .iter()
            .map(|r| {
                RegexBuilder::new(&r.pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| (re, r.hint.clone()))
                    .map_err(|e| {
                        HiveError::Configuration(format!("invalid hint pattern '{}': {e}", r.pattern))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Preclassifier for PatternPreclassifier {
    fn hints(&self, query: &str) -> Vec<String> {
        self.rules
            .iter()
            .filter(|(re, _)| re.is_match(query))
            .map(|(re, hint)| {
                // 提示中的 {match} 替换为命中的文本
                match re.find(query) {
                    Some(m) => hint.replace("{match}", m.as_str()),
                    None => hint.clone(),
                }
            })
            .collect()
    }
}

/// 拼装单次运行的系统提示
pub fn build_system_prompt(
    base: &str,
    agents: &[Arc<AgentDescriptor>],
    registry: &CapabilityRegistry,
    memory_context: Option<&str>,
    hints: &[String],
) -> String {
    let mut out = String::with_capacity(base.len() + 2048);
    out.push_str(base.trim());

    out.push_str("\n\n## Agents\n");
    for agent in agents {
        out.push_str(&agent.summary());
        out.push('\n');
    }

    out.push_str("\n## Available capabilities\n");
    out.push_str(&registry.menu_json());
    out.push('\n');

    out.push_str("\n## Response format\n");
    out.push_str(
        "Reply with exactly one JSON object. To call a capability: {\"thought\": \"...\", \"tool\": \"<name>\", \"args\": {...}}. \
To finish: {\"thought\": \"...\", \"answer\": \"...\"}. Schema:\n",
    );
    out.push_str(&decision_format_schema_json());
    out.push('\n');

    if let Some(memory) = memory_context.filter(|m| !m.trim().is_empty()) {
        out.push_str("\n## What you remember about this user\n");
        out.push_str(memory);
        out.push('\n');
    }

    if !hints.is_empty() {
        out.push_str("\n## Hints\n");
        for hint in hints {
            out.push_str("- ");
            out.push_str(hint);
            out.push('\n');
        }
    }
    out
}

/// 决策回合（assistant）：回放决策后端选择的动作
pub fn render_decision(rationale: &str, capability: &str, arguments: &Value) -> String {
    serde_json::json!({
        "thought": rationale,
        "tool": capability,
        "args": arguments,
    })
    .to_string()
}

/// 观察回合（user）
pub fn render_observation(capability: &str, text: &str) -> String {
    format!("Observation from {capability}: {text}")
}
