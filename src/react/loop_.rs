//! 编排主循环（ReAct）
//!
//! Init -> AwaitingDecision -> (ExecutingCapability -> AwaitingDecision)* -> Terminal
//!
//! 每轮：决策后端给出动作 -> 校验能力名 -> 记忆回填参数 -> schema 校验 -> 经 SessionManager 调用 ->
//! 记录 Tool 条目 -> 观察写回上下文。单次调用级错误作为观察反馈给决策后端，查询级错误终止本次运行；
//! 无论成功、失败还是取消，轨迹都会交给 TraceSink。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{ErrorKind, HiveError, RecoveryAction, RecoveryEngine};
use crate::llm::Message;
use crate::memory::{MemoryRecord, UserMemory};
use crate::react::context::{
    build_system_prompt, render_decision, render_observation, Preclassifier, DEFAULT_SYSTEM_PROMPT,
};
use crate::react::{Decision, DecisionBackend, DecisionRequest, OrchestratorEvent};
use crate::registry::{schema, Capability, CapabilityRegistry, SharedRegistry};
use crate::session::SessionManager;
use crate::trace::{
    Action, ReasoningStep, ToolOutcome, ToolStep, Trace, TraceEntry, TraceRecorder, TraceSink,
    TraceStatus,
};

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 决策/调用循环上限（至少 1）
    pub max_cycles: usize,
    /// 调用方未指定时的查询截止时间
    pub default_deadline: Option<Duration>,
    pub system_prompt: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_cycles: 8,
            default_deadline: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// 单次运行的可选参数
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub deadline: Option<Duration>,
    /// 调用方持有的取消令牌；运行内部使用其子令牌
    pub cancel: Option<CancellationToken>,
    pub events: Option<UnboundedSender<OrchestratorEvent>>,
}

impl RunOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

/// 成功：最终回答 + 完整轨迹
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub answer: String,
    pub trace: Trace,
}

/// 失败：错误类别 + 部分轨迹
#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct QueryFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Trace,
}

pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    registry: Arc<SharedRegistry>,
    backend: Arc<dyn DecisionBackend>,
    memory: Option<Arc<UserMemory>>,
    sink: Option<Arc<dyn TraceSink>>,
    preclassifier: Option<Arc<dyn Preclassifier>>,
    recovery: RecoveryEngine,
    settings: OrchestratorSettings,
}

fn emit(events: Option<&UnboundedSender<OrchestratorEvent>>, ev: OrchestratorEvent) {
    if let Some(tx) = events {
        let _ = tx.send(ev);
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<SharedRegistry>,
        backend: Arc<dyn DecisionBackend>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            sessions,
            registry,
            backend,
            memory: None,
            sink: None,
            preclassifier: None,
            recovery: RecoveryEngine::new(),
            settings,
        }
    }

    pub fn with_memory(mut self, memory: Arc<UserMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_preclassifier(mut self, preclassifier: Arc<dyn Preclassifier>) -> Self {
        self.preclassifier = Some(preclassifier);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> Option<&Arc<UserMemory>> {
        self.memory.as_ref()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 决策后端累计 token 使用
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.backend.token_usage()
    }

    pub async fn run_query(&self, query: &str, user_id: &str) -> Result<QueryOutcome, QueryFailure> {
        self.run_query_with(query, user_id, RunOptions::default()).await
    }

    /// 在独立任务中运行查询
    ///
    /// 返回的 future 被丢弃时（如 HTTP 客户端断开）取消运行：在途调用的会话被重置，
    /// 部分轨迹照常交给 TraceSink。
    pub async fn run_query_detached(
        self: &Arc<Self>,
        query: &str,
        user_id: &str,
        mut options: RunOptions,
    ) -> Result<QueryOutcome, QueryFailure> {
        let token = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let guard = token.clone().drop_guard();
        options.cancel = Some(token);

        let this = Arc::clone(self);
        let (q, u) = (query.to_string(), user_id.to_string());
        let handle = tokio::spawn(async move { this.run_query_with(&q, &u, options).await });
        let joined = handle.await;
        let _ = guard.disarm();

        joined.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Query task aborted");
            let message = format!("query task aborted: {e}");
            Err(QueryFailure {
                kind: ErrorKind::Internal,
                trace: TraceRecorder::new(query, user_id).finish(TraceStatus::Failed {
                    kind: ErrorKind::Internal,
                    message: message.clone(),
                }),
                message,
            })
        })
    }

    pub async fn run_query_with(
        &self,
        query: &str,
        user_id: &str,
        options: RunOptions,
    ) -> Result<QueryOutcome, QueryFailure> {
        let cancel = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let deadline = options.deadline.or(self.settings.default_deadline);
        let deadline_at = deadline.map(|d| Instant::now() + d);
        let timer = deadline.map(|d| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(d).await;
                token.cancel();
            })
        });
        let events = options.events.as_ref();

        let mut recorder = TraceRecorder::new(query, user_id);
        let run_id = recorder.run_id();
        tracing::info!(run_id = %run_id, user_id = %user_id, "Query started");
        emit(
            events,
            OrchestratorEvent::RunStarted {
                run_id,
                query: query.to_string(),
            },
        );

        let result = self
            .drive(query, user_id, &mut recorder, &cancel, deadline_at, events)
            .await
            .map_err(|e| classify_cancel(e, deadline_at));
        if let Some(timer) = timer {
            timer.abort();
        }

        let status = match &result {
            Ok(_) => TraceStatus::Completed,
            Err(e) => TraceStatus::Failed {
                kind: e.kind(),
                message: e.to_string(),
            },
        };

        if let (Ok(_), Some(memory)) = (&result, &self.memory) {
            if let Err(e) = memory.record_query(user_id, query).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to record query history");
            }
        }

        let trace = recorder.finish(status.clone());
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&trace).await {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to persist trace");
            }
        }
        emit(
            events,
            OrchestratorEvent::Finished {
                run_id,
                outcome: status,
            },
        );

        match result {
            Ok(answer) => {
                tracing::info!(run_id = %run_id, steps = trace.len(), "Query completed");
                Ok(QueryOutcome { answer, trace })
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, kind = %e.kind(), error = %e, steps = trace.len(), "Query failed");
                Err(QueryFailure {
                    kind: e.kind(),
                    message: e.to_string(),
                    trace,
                })
            }
        }
    }

    async fn drive(
        &self,
        query: &str,
        user_id: &str,
        recorder: &mut TraceRecorder,
        cancel: &CancellationToken,
        deadline_at: Option<Instant>,
        events: Option<&UnboundedSender<OrchestratorEvent>>,
    ) -> Result<String, HiveError> {
        // Init
        let registry = self.registry.snapshot().await;
        let record = self.memory_record(user_id).await;
        let memory_context = record.as_ref().and_then(UserMemory::render_context);
        let hints = self
            .preclassifier
            .as_ref()
            .map(|p| p.hints(query))
            .unwrap_or_default();
        let system = build_system_prompt(
            &self.settings.system_prompt,
            self.sessions.descriptors(),
            &registry,
            memory_context.as_deref(),
            &hints,
        );
        let mut turns = vec![Message::user(query)];
        let max_cycles = self.settings.max_cycles.max(1);

        for cycle in 1..=max_cycles {
            if cancel.is_cancelled() {
                return Err(HiveError::Cancelled);
            }
            emit(events, OrchestratorEvent::CycleStarted { cycle, max_cycles });

            // AwaitingDecision
            let request = DecisionRequest {
                system: &system,
                turns: &turns,
                menu: registry.list_all(),
            };
            let decided = tokio::select! {
                d = self.backend.decide(request) => Some(d),
                _ = cancel.cancelled() => None,
            };
            let decision = match decided {
                None => return Err(HiveError::Cancelled),
                Some(Ok(d)) => d,
                Some(Err(e @ HiveError::DecisionProtocol(_))) => {
                    let rejected = ReasoningStep::new(
                        String::new(),
                        Action::Rejected {
                            error: e.to_string(),
                        },
                    );
                    record_reasoning(recorder, rejected, events)?;
                    return Err(e);
                }
                Some(Err(e)) => return Err(e),
            };

            let (rationale, capability, arguments) = match decision {
                Decision::Answer { rationale, text } => {
                    let step = ReasoningStep::new(rationale, Action::Answer { text: text.clone() });
                    record_reasoning(recorder, step, events)?;
                    return Ok(text);
                }
                Decision::Invoke {
                    rationale,
                    capability,
                    arguments,
                } => (rationale, capability, arguments),
            };

            turns.push(Message::assistant(render_decision(
                &rationale,
                &capability,
                &arguments,
            )));
            let step = ReasoningStep::new(
                rationale,
                Action::Invoke {
                    capability: capability.clone(),
                    arguments: arguments.clone(),
                },
            );
            record_reasoning(recorder, step, events)?;

            // ExecutingCapability
            let (tool_step, outcome) = self
                .execute(&registry, user_id, &capability, arguments, cancel, deadline_at, events)
                .await;
            recorder.record_tool(tool_step)?;
            if let Some(TraceEntry::Tool(step)) = recorder.entries().last() {
                emit(events, OrchestratorEvent::ToolFinished { step: step.clone() });
            }

            let observation = match outcome {
                Ok(text) => text,
                Err(e) => match self.recovery.handle(&e, &registry.names()) {
                    RecoveryAction::Observe(text) => text,
                    RecoveryAction::Abort => return Err(e),
                },
            };
            turns.push(Message::user(render_observation(&capability, &observation)));
        }

        Err(HiveError::LoopBoundExceeded(max_cycles))
    }

    /// 解析、回填、校验、调用；返回待记录的 Tool 条目与原始结果
    async fn execute(
        &self,
        registry: &CapabilityRegistry,
        user_id: &str,
        capability: &str,
        arguments: Value,
        cancel: &CancellationToken,
        deadline_at: Option<Instant>,
        events: Option<&UnboundedSender<OrchestratorEvent>>,
    ) -> (ToolStep, Result<String, HiveError>) {
        let started_at = Utc::now();
        let (agent, arguments, result) = match registry.resolve(capability) {
            Err(e) => (None, arguments, Err(e)),
            Ok(cap) => {
                let arguments = self.backfill(user_id, cap, arguments, events).await;
                emit(
                    events,
                    OrchestratorEvent::ToolStarted {
                        capability: cap.name.clone(),
                        agent: Some(cap.agent.clone()),
                        arguments: arguments.clone(),
                    },
                );
                let result = match schema::validate(&cap.input_schema, &arguments) {
                    Err(message) => Err(HiveError::InvalidArguments {
                        capability: cap.name.clone(),
                        message,
                    }),
                    Ok(()) => {
                        self.sessions
                            .invoke(&cap.agent, &cap.name, arguments.clone(), cancel)
                            .await
                    }
                };
                (Some(cap.agent.clone()), arguments, result)
            }
        };
        let ended_at = Utc::now();
        let result = result.map_err(|e| classify_cancel(e, deadline_at));

        let outcome = match &result {
            Ok(text) => ToolOutcome::Ok { result: text.clone() },
            Err(e) => ToolOutcome::from_error(e),
        };
        let step = ToolStep::new(capability, agent, arguments, outcome, started_at, ended_at);

        let audit = serde_json::json!({
            "event": "tool_audit",
            "capability": step.capability,
            "agent": step.agent,
            "ok": step.outcome.is_ok(),
            "outcome": match &step.outcome {
                ToolOutcome::Ok { .. } => "ok".to_string(),
                ToolOutcome::Error { kind, .. } => kind.to_string(),
            },
            "duration_ms": step.duration_ms,
            "args_preview": args_preview(&step.arguments),
        });
        tracing::info!(audit = %audit, "tool");

        if let (Ok(_), Some(memory)) = (&result, &self.memory) {
            if let Err(e) = memory
                .record_call_args(user_id, capability, &step.arguments)
                .await
            {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to record call arguments");
            }
        }
        (step, result)
    }

    async fn backfill(
        &self,
        user_id: &str,
        cap: &Capability,
        arguments: Value,
        events: Option<&UnboundedSender<OrchestratorEvent>>,
    ) -> Value {
        let Some(record) = self.memory_record(user_id).await else {
            return arguments;
        };
        let (arguments, filled) =
            UserMemory::backfill(&record, &cap.name, &cap.input_schema, arguments);
        if !filled.is_empty() {
            tracing::info!(capability = %cap.name, keys = ?filled, "Arguments back-filled from memory");
            emit(
                events,
                OrchestratorEvent::ArgumentsBackfilled {
                    capability: cap.name.clone(),
                    keys: filled,
                },
            );
        }
        arguments
    }

    /// 记忆读取失败不影响查询，只记录日志
    async fn memory_record(&self, user_id: &str) -> Option<MemoryRecord> {
        let memory = self.memory.as_ref()?;
        match memory.get(user_id).await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to read user memory");
                None
            }
        }
    }
}

/// 截止时间已过时，取消归为 DeadlineExceeded
fn classify_cancel(err: HiveError, deadline_at: Option<Instant>) -> HiveError {
    match err {
        HiveError::Cancelled if deadline_at.is_some_and(|at| Instant::now() >= at) => {
            HiveError::DeadlineExceeded
        }
        other => other,
    }
}

fn record_reasoning(
    recorder: &mut TraceRecorder,
    step: ReasoningStep,
    events: Option<&UnboundedSender<OrchestratorEvent>>,
) -> Result<(), HiveError> {
    recorder.record_reasoning(step)?;
    if let Some(TraceEntry::Reasoning(step)) = recorder.entries().last() {
        emit(events, OrchestratorEvent::Reasoning { step: step.clone() });
    }
    Ok(())
}
