//! 会话管理器：每个 Agent 一个受管会话，进程内复用
//!
//! 同一 Agent 的调用在会话锁上排队，协议层不会交错；连接丢失时重建一次会话并重发调用（至少一次语义）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::AgentsSection;
use crate::core::HiveError;
use crate::manifest::AgentDescriptor;
use crate::session::protocol::{RemoteCapability, TransportError};
use crate::session::session::{AgentSession, SessionState};
use crate::session::transport::{Connector, ProcessConnector};

/// 会话超时设置
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&AgentsSection> for SessionSettings {
    fn from(section: &AgentsSection) -> Self {
        Self {
            call_timeout: Duration::from_secs(section.call_timeout_secs.max(1)),
            handshake_timeout: Duration::from_secs(section.handshake_timeout_secs.max(1)),
        }
    }
}

pub struct SessionManager {
    descriptors: Vec<Arc<AgentDescriptor>>,
    sessions: HashMap<String, Arc<Mutex<AgentSession>>>,
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        descriptors: Vec<AgentDescriptor>,
        connector: Arc<dyn Connector>,
        settings: SessionSettings,
    ) -> Self {
        let descriptors: Vec<Arc<AgentDescriptor>> = descriptors.into_iter().map(Arc::new).collect();
        let sessions = descriptors
            .iter()
            .map(|d| {
                (
                    d.name.clone(),
                    Arc::new(Mutex::new(AgentSession::new(Arc::clone(d)))),
                )
            })
            .collect();
        Self {
            descriptors,
            sessions,
            connector,
            settings,
        }
    }

    /// 使用默认的子进程 / HTTP 连接器
    pub fn with_process_connector(descriptors: Vec<AgentDescriptor>, settings: SessionSettings) -> Self {
        Self::new(descriptors, Arc::new(ProcessConnector::new()), settings)
    }

    /// 按清单顺序
    pub fn descriptors(&self) -> &[Arc<AgentDescriptor>] {
        &self.descriptors
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings
    }

    fn session(&self, agent: &str) -> Result<&Arc<Mutex<AgentSession>>, HiveError> {
        self.sessions
            .get(agent)
            .ok_or_else(|| HiveError::agent_unavailable(agent, "agent is not configured"))
    }

    /// 发现握手：会话未就绪时建立连接，已就绪时直接返回缓存的能力列表
    pub async fn discover(&self, agent: &str) -> Result<Vec<RemoteCapability>, HiveError> {
        let mut session = self.session(agent)?.lock().await;
        self.ensure_ready(&mut session).await?;
        Ok(session.capabilities().to_vec())
    }

    /// 在现有会话上重新拉取能力列表（用于注册表重建）
    pub async fn rediscover(&self, agent: &str) -> Result<Vec<RemoteCapability>, HiveError> {
        let mut session = self.session(agent)?.lock().await;
        if session.state() == SessionState::Ready {
            match session.refresh_capabilities().await {
                Ok(caps) => return Ok(caps.to_vec()),
                Err(e) => {
                    tracing::warn!(agent = %agent, error = %e, "Capability refresh failed, reconnecting");
                    session.reset().await;
                }
            }
        }
        self.ensure_ready(&mut session).await?;
        Ok(session.capabilities().to_vec())
    }

    /// 启动时并发连接全部 Agent；失败只记录日志
    pub async fn connect_all(&self) -> Vec<(String, Result<usize, HiveError>)> {
        let attempts = self.descriptors.iter().map(|d| async move {
            let result = self.discover(&d.name).await.map(|caps| caps.len());
            if let Err(e) = &result {
                tracing::warn!(agent = %d.name, error = %e, "Failed to connect agent (continuing without it)");
            }
            (d.name.clone(), result)
        });
        join_all(attempts).await
    }

    /// 调用能力，返回结果文本
    ///
    /// - 会话无法建立（含重连失败）：AgentUnavailable
    /// - 远端报错 / isError / 无文本输出 / 超时：CapabilityExecution
    /// - cancel 触发：关闭在途会话后返回 Cancelled
    pub async fn invoke(
        &self,
        agent: &str,
        capability: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<String, HiveError> {
        let session = self.session(agent)?;
        let mut session = tokio::select! {
            guard = session.lock() => guard,
            _ = cancel.cancelled() => return Err(HiveError::Cancelled),
        };

        let mut reconnected = false;
        loop {
            if session.state() != SessionState::Ready {
                let connected = tokio::select! {
                    r = self.ensure_ready(&mut session) => Some(r),
                    _ = cancel.cancelled() => None,
                };
                match connected {
                    Some(r) => r?,
                    None => {
                        session.reset().await;
                        return Err(HiveError::Cancelled);
                    }
                }
            }

            let outcome = tokio::select! {
                r = tokio::time::timeout(self.settings.call_timeout, session.call(capability, arguments.clone())) => Some(r),
                _ = cancel.cancelled() => None,
            };

            let outcome = match outcome {
                Some(outcome) => outcome,
                None => {
                    tracing::info!(agent = %agent, capability = %capability, "Call cancelled, closing session");
                    session.reset().await;
                    return Err(HiveError::Cancelled);
                }
            };

            match outcome {
                Err(_) => {
                    session.reset().await;
                    return Err(HiveError::execution(
                        capability,
                        format!("timed out after {}s", self.settings.call_timeout.as_secs()),
                    ));
                }
                Ok(Ok(result)) => {
                    let text = result.text();
                    if result.is_error {
                        let message = if text.trim().is_empty() {
                            "remote reported an error".to_string()
                        } else {
                            text
                        };
                        return Err(HiveError::execution(capability, message));
                    }
                    if text.trim().is_empty() {
                        return Err(HiveError::execution(capability, "returned no usable output"));
                    }
                    return Ok(text);
                }
                Ok(Err(e)) if e.is_connection_loss() => {
                    session.reset().await;
                    if reconnected {
                        return Err(HiveError::agent_unavailable(agent, e.to_string()));
                    }
                    tracing::warn!(agent = %agent, error = %e, "Session lost, reconnecting once");
                    reconnected = true;
                }
                Ok(Err(TransportError::Rpc { message, .. })) => {
                    return Err(HiveError::execution(capability, message));
                }
                Ok(Err(e)) => return Err(HiveError::execution(capability, e.to_string())),
            }
        }
    }

    async fn ensure_ready(&self, session: &mut AgentSession) -> Result<(), HiveError> {
        if session.state() == SessionState::Ready {
            return Ok(());
        }
        session
            .connect(self.connector.as_ref(), self.settings.handshake_timeout)
            .await
            .map_err(|e| HiveError::agent_unavailable(session.name(), e.to_string()))
    }

    pub async fn state(&self, agent: &str) -> Option<SessionState> {
        match self.sessions.get(agent) {
            Some(s) => Some(s.lock().await.state()),
            None => None,
        }
    }

    /// 该 Agent 完成发现握手的次数
    pub async fn handshake_count(&self, agent: &str) -> u64 {
        match self.sessions.get(agent) {
            Some(s) => s.lock().await.handshakes(),
            None => 0,
        }
    }

    /// 关闭全部会话；在途调用完成后才能拿到锁
    pub async fn shutdown(&self) {
        for d in &self.descriptors {
            if let Some(s) = self.sessions.get(&d.name) {
                s.lock().await.close().await;
            }
        }
        tracing::info!(agents = self.descriptors.len(), "All agent sessions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ConnectionSpec;
    use crate::session::local::{LocalAgent, LocalConnector};
    use serde_json::json;

    fn descriptor(name: &str) -> AgentDescriptor {
        AgentDescriptor {
            name: name.to_string(),
            description: format!("{name} agent"),
            connection: ConnectionSpec::Http {
                url: "http://unused".to_string(),
                api_key_env: None,
            },
            tools: vec![],
        }
    }

    fn sales_agent() -> LocalAgent {
        LocalAgent::new()
            .tool(
                "total_sales",
                "Total sales for a region",
                json!({"type": "object", "properties": {"region": {"type": "string"}}}),
                |args| Ok(format!("sales in {}: 42", args["region"].as_str().unwrap_or("?"))),
            )
            .tool("broken", "Always fails", json!({"type": "object"}), |_| {
                Err("database offline".to_string())
            })
            .tool("silent", "Returns nothing", json!({"type": "object"}), |_| Ok(String::new()))
    }

    fn manager(connector: &LocalConnector, settings: SessionSettings) -> SessionManager {
        SessionManager::new(
            vec![descriptor("sales")],
            Arc::new(connector.clone()),
            settings,
        )
    }

    #[tokio::test]
    async fn test_lazy_connect_and_session_reuse() {
        let connector = LocalConnector::new().agent("sales", sales_agent());
        let mgr = manager(&connector, SessionSettings::default());
        assert_eq!(mgr.state("sales").await, Some(SessionState::Disconnected));
        assert_eq!(connector.connect_count("sales"), 0);

        let cancel = CancellationToken::new();
        let first = mgr
            .invoke("sales", "total_sales", json!({"region": "Europe"}), &cancel)
            .await
            .unwrap();
        let second = mgr
            .invoke("sales", "total_sales", json!({"region": "Europe"}), &cancel)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(mgr.handshake_count("sales").await, 1);
        assert_eq!(connector.connect_count("sales"), 1);
    }

    #[tokio::test]
    async fn test_discover_returns_schemas() {
        let connector = LocalConnector::new().agent("sales", sales_agent());
        let mgr = manager(&connector, SessionSettings::default());
        let caps = mgr.discover("sales").await.unwrap();
        assert_eq!(caps.len(), 3);
        assert_eq!(caps[0].name, "total_sales");
        assert_eq!(caps[0].input_schema["properties"]["region"]["type"], "string");
        mgr.discover("sales").await.unwrap();
        assert_eq!(mgr.handshake_count("sales").await, 1);
    }

    #[tokio::test]
    async fn test_reconnects_once_after_connection_loss() {
        let connector = LocalConnector::new().agent("sales", sales_agent());
        let mgr = manager(&connector, SessionSettings::default());
        let cancel = CancellationToken::new();
        mgr.discover("sales").await.unwrap();

        connector.break_connection("sales");
        let out = mgr
            .invoke("sales", "total_sales", json!({"region": "Asia"}), &cancel)
            .await
            .unwrap();
        assert!(out.contains("Asia"));
        assert_eq!(connector.connect_count("sales"), 2);
    }

    #[tokio::test]
    async fn test_unavailable_when_reconnect_fails() {
        let connector = LocalConnector::new().agent("sales", sales_agent());
        let mgr = manager(&connector, SessionSettings::default());
        let cancel = CancellationToken::new();
        mgr.discover("sales").await.unwrap();

        connector.break_connection("sales");
        connector.refuse("sales");
        let err = mgr
            .invoke("sales", "total_sales", json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::AgentUnavailable { .. }));
        assert_eq!(mgr.state("sales").await, Some(SessionState::Disconnected));

        connector.allow("sales");
        assert!(mgr.invoke("sales", "total_sales", json!({}), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_remote_error_and_empty_output() {
        let connector = LocalConnector::new().agent("sales", sales_agent());
        let mgr = manager(&connector, SessionSettings::default());
        let cancel = CancellationToken::new();

        match mgr.invoke("sales", "broken", json!({}), &cancel).await {
            Err(HiveError::CapabilityExecution { message, .. }) => {
                assert!(message.contains("database offline"))
            }
            other => panic!("expected execution error, got {other:?}"),
        }
        assert!(matches!(
            mgr.invoke("sales", "silent", json!({}), &cancel).await,
            Err(HiveError::CapabilityExecution { .. })
        ));
        // 远端错误不影响会话
        assert_eq!(mgr.state("sales").await, Some(SessionState::Ready));
    }

    #[tokio::test]
    async fn test_call_timeout_resets_session() {
        let connector =
            LocalConnector::new().agent("sales", sales_agent().delay(Duration::from_millis(500)));
        let mgr = manager(
            &connector,
            SessionSettings {
                call_timeout: Duration::from_millis(50),
                handshake_timeout: Duration::from_secs(5),
            },
        );
        let err = mgr
            .invoke("sales", "total_sales", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(mgr.state("sales").await, Some(SessionState::Disconnected));
    }

    #[tokio::test]
    async fn test_cancellation_closes_in_flight_call() {
        let connector =
            LocalConnector::new().agent("sales", sales_agent().delay(Duration::from_secs(5)));
        let mgr = manager(&connector, SessionSettings::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = mgr
            .invoke("sales", "total_sales", json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Cancelled));
        assert_eq!(mgr.state("sales").await, Some(SessionState::Disconnected));
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let connector =
            LocalConnector::new().agent("sales", sales_agent().delay(Duration::from_millis(30)));
        let mgr = Arc::new(manager(&connector, SessionSettings::default()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let mgr = Arc::clone(&mgr);
            handles.push(tokio::spawn(async move {
                mgr.invoke(
                    "sales",
                    "total_sales",
                    json!({ "region": format!("r{i}") }),
                    &CancellationToken::new(),
                )
                .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(connector.max_concurrency("sales"), 1);
        assert_eq!(connector.calls().len(), 4);
        assert_eq!(mgr.handshake_count("sales").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_and_shutdown() {
        let connector = LocalConnector::new().agent("sales", sales_agent());
        let mgr = manager(&connector, SessionSettings::default());
        let cancel = CancellationToken::new();
        assert!(matches!(
            mgr.invoke("ghost", "x", json!({}), &cancel).await,
            Err(HiveError::AgentUnavailable { .. })
        ));

        mgr.invoke("sales", "total_sales", json!({}), &cancel).await.unwrap();
        mgr.shutdown().await;
        assert_eq!(mgr.state("sales").await, Some(SessionState::Closed));
        assert!(matches!(
            mgr.invoke("sales", "total_sales", json!({}), &cancel).await,
            Err(HiveError::AgentUnavailable { .. })
        ));
    }
}
