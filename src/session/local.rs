//! 进程内 Agent：用 Rust 闭包实现能力，走与远程 Agent 相同的 JSON-RPC 路径
//!
//! 用于嵌入式部署与测试；LocalConnector 记录连接次数、调用参数与并发度，并可模拟连接故障。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::manifest::AgentDescriptor;
use crate::session::protocol::{RemoteCapability, TransportError, PROTOCOL_VERSION};
use crate::session::transport::{Connector, Transport};

pub type ToolHandler = Arc<dyn Fn(Value) -> Result<String, String> + Send + Sync>;

/// 进程内 Agent 定义
#[derive(Clone, Default)]
pub struct LocalAgent {
    tools: Vec<(RemoteCapability, ToolHandler)>,
    delay: Option<Duration>,
}

impl LocalAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool<F>(mut self, name: &str, description: &str, input_schema: Value, handler: F) -> Self
    where
        F: Fn(Value) -> Result<String, String> + Send + Sync + 'static,
    {
        self.tools.push((
            RemoteCapability {
                name: name.to_string(),
                description: Some(description.to_string()),
                input_schema,
            },
            Arc::new(handler),
        ));
        self
    }

    /// 每次调用前等待的时长（模拟慢 Agent）
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct LocalState {
    connects: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<(String, String, Value)>>,
    refused: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    active: Mutex<HashMap<String, usize>>,
    max_active: Mutex<HashMap<String, usize>>,
}

/// 在途调用计数；调用被取消（future 被丢弃）时同样归还
struct ActiveGuard {
    name: String,
    state: Arc<LocalState>,
}

impl ActiveGuard {
    fn enter(name: &str, state: &Arc<LocalState>) -> Self {
        let now = state
            .active
            .lock()
            .map(|mut a| {
                let entry = a.entry(name.to_string()).or_insert(0);
                *entry += 1;
                *entry
            })
            .unwrap_or(0);
        if let Ok(mut m) = state.max_active.lock() {
            let entry = m.entry(name.to_string()).or_insert(0);
            *entry = (*entry).max(now);
        }
        Self {
            name: name.to_string(),
            state: Arc::clone(state),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut a) = self.state.active.lock() {
            if let Some(n) = a.get_mut(&self.name) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

/// 按 Agent 名分发到 LocalAgent 的连接器
#[derive(Clone, Default)]
pub struct LocalConnector {
    agents: HashMap<String, LocalAgent>,
    state: Arc<LocalState>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, name: &str, agent: LocalAgent) -> Self {
        self.agents.insert(name.to_string(), agent);
        self
    }

    /// 之后对该 Agent 的连接全部失败
    pub fn refuse(&self, agent: &str) {
        if let Ok(mut r) = self.state.refused.lock() {
            r.insert(agent.to_string());
        }
    }

    pub fn allow(&self, agent: &str) {
        if let Ok(mut r) = self.state.refused.lock() {
            r.remove(agent);
        }
    }

    /// 该 Agent 现有连接的下一次请求返回 Closed
    pub fn break_connection(&self, agent: &str) {
        if let Ok(mut b) = self.state.broken.lock() {
            b.insert(agent.to_string());
        }
    }

    pub fn connect_count(&self, agent: &str) -> usize {
        self.state
            .connects
            .lock()
            .map(|c| c.get(agent).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// (agent, capability, arguments)，按调用顺序
    pub fn calls(&self) -> Vec<(String, String, Value)> {
        self.state.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// 单个 Agent 上观察到的最大并发调用数
    pub fn max_concurrency(&self, agent: &str) -> usize {
        self.state
            .max_active
            .lock()
            .map(|m| m.get(agent).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, descriptor: &AgentDescriptor) -> Result<Box<dyn Transport>, TransportError> {
        let refused = self
            .state
            .refused
            .lock()
            .map(|r| r.contains(&descriptor.name))
            .unwrap_or(false);
        if refused {
            return Err(TransportError::Io(format!("connection to '{}' refused", descriptor.name)));
        }
        let agent = self
            .agents
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| TransportError::Io(format!("no local agent named '{}'", descriptor.name)))?;
        if let Ok(mut c) = self.state.connects.lock() {
            *c.entry(descriptor.name.clone()).or_insert(0) += 1;
        }
        // 新连接是健康的
        if let Ok(mut b) = self.state.broken.lock() {
            b.remove(&descriptor.name);
        }
        Ok(Box::new(LocalTransport {
            name: descriptor.name.clone(),
            agent,
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct LocalTransport {
    name: String,
    agent: LocalAgent,
    state: Arc<LocalState>,
    open: bool,
}

impl LocalTransport {
    fn take_broken(&self) -> bool {
        self.state
            .broken
            .lock()
            .map(|mut b| b.remove(&self.name))
            .unwrap_or(false)
    }

    async fn call(&self, params: Value) -> Result<Value, TransportError> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
        let (_, handler) = self
            .agent
            .tools
            .iter()
            .find(|(cap, _)| cap.name == name)
            .ok_or_else(|| TransportError::Rpc {
                code: -32602,
                message: format!("Unknown tool: {name}"),
            })?;

        if let Ok(mut c) = self.state.calls.lock() {
            c.push((self.name.clone(), name.to_string(), arguments.clone()));
        }

        let _active = ActiveGuard::enter(&self.name, &self.state);
        if let Some(delay) = self.agent.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = handler(arguments);

        Ok(match outcome {
            Ok(text) => json!({ "content": [{ "type": "text", "text": text }], "isError": false }),
            Err(text) => json!({ "content": [{ "type": "text", "text": text }], "isError": true }),
        })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        if !self.open || self.take_broken() {
            self.open = false;
            return Err(TransportError::Closed);
        }
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": self.name }
            })),
            "tools/list" => Ok(json!({
                "tools": self.agent.tools.iter().map(|(cap, _)| cap).collect::<Vec<_>>()
            })),
            "tools/call" => self.call(params.unwrap_or(Value::Null)).await,
            other => Err(TransportError::Rpc {
                code: -32601,
                message: format!("Method not found: {other}"),
            }),
        }
    }

    async fn notify(&mut self, _method: &str, _params: Option<Value>) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    async fn close(&mut self) {
        self.open = false;
    }
}
