//! ReAct 编排层：决策后端、上下文拼装、事件与主循环

pub mod context;
pub mod events;
pub mod loop_;
pub mod planner;

pub use context::{PatternPreclassifier, Preclassifier, DEFAULT_SYSTEM_PROMPT};
pub use events::OrchestratorEvent;
pub use loop_::{Orchestrator, OrchestratorSettings, QueryFailure, QueryOutcome, RunOptions};
pub use planner::{
    decision_format_schema_json, parse_decision, Decision, DecisionBackend, DecisionRequest,
    Planner,
};
