//! 单个 Agent 的会话状态机：Disconnected → Connecting → Ready → Closed
//!
//! 会话独占一个 Transport；握手 = initialize + notifications/initialized + tools/list。
//! 任意失败路径都会关闭 Transport，不留下子进程。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::manifest::AgentDescriptor;
use crate::session::protocol::{
    initialize_params, CallToolResult, ListToolsResult, RemoteCapability, TransportError,
};
use crate::session::transport::{Connector, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    /// 已关闭，不再重连
    Closed,
}

pub struct AgentSession {
    descriptor: Arc<AgentDescriptor>,
    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    capabilities: Vec<RemoteCapability>,
    handshakes: u64,
}

impl AgentSession {
    pub fn new(descriptor: Arc<AgentDescriptor>) -> Self {
        Self {
            descriptor,
            state: SessionState::Disconnected,
            transport: None,
            capabilities: Vec::new(),
            handshakes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 最近一次握手发现的能力
    pub fn capabilities(&self) -> &[RemoteCapability] {
        &self.capabilities
    }

    /// 成功完成的握手次数
    pub fn handshakes(&self) -> u64 {
        self.handshakes
    }

    /// 建立连接并完成发现握手；已 Ready 时直接返回
    pub async fn connect(
        &mut self,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        match self.state {
            SessionState::Ready => return Ok(()),
            SessionState::Closed => return Err(TransportError::Closed),
            _ => {}
        }

        self.state = SessionState::Connecting;
        let attempt = tokio::time::timeout(timeout, handshake(connector, &self.descriptor)).await;
        match attempt {
            Ok(Ok((transport, capabilities))) => {
                tracing::info!(
                    agent = %self.descriptor.name,
                    capabilities = ?capabilities.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "Agent session ready"
                );
                self.transport = Some(transport);
                self.capabilities = capabilities;
                self.handshakes += 1;
                self.state = SessionState::Ready;
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
            // 超时：handshake future 已被丢弃，子进程随 kill_on_drop 回收
            Err(_) => {
                self.state = SessionState::Disconnected;
                Err(TransportError::Timeout)
            }
        }
    }

    /// 在已建立的连接上重新拉取 tools/list（不重做握手）
    pub async fn refresh_capabilities(&mut self) -> Result<&[RemoteCapability], TransportError> {
        let transport = self.ready_transport()?;
        let listed = transport.request("tools/list", None).await?;
        let listed: ListToolsResult = serde_json::from_value(listed)
            .map_err(|e| TransportError::Protocol(format!("failed to parse tools: {e}")))?;
        self.capabilities = listed.tools;
        Ok(&self.capabilities)
    }

    pub(crate) async fn call(
        &mut self,
        capability: &str,
        arguments: Value,
    ) -> Result<CallToolResult, TransportError> {
        let transport = self.ready_transport()?;
        let result = transport
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": capability, "arguments": arguments })),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| TransportError::Protocol(format!("failed to parse tool result: {e}")))
    }

    /// 丢弃当前连接，下次使用时重连
    pub async fn reset(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if self.state != SessionState::Closed {
            self.state = SessionState::Disconnected;
        }
    }

    /// 永久关闭
    pub async fn close(&mut self) {
        self.reset().await;
        self.state = SessionState::Closed;
    }

    fn ready_transport(&mut self) -> Result<&mut Box<dyn Transport>, TransportError> {
        if self.state != SessionState::Ready {
            return Err(TransportError::Closed);
        }
        self.transport.as_mut().ok_or(TransportError::Closed)
    }
}

async fn handshake(
    connector: &dyn Connector,
    descriptor: &AgentDescriptor,
) -> Result<(Box<dyn Transport>, Vec<RemoteCapability>), TransportError> {
    let mut transport = connector.connect(descriptor).await?;
    match discover(transport.as_mut()).await {
        Ok(capabilities) => Ok((transport, capabilities)),
        Err(e) => {
            transport.close().await;
            Err(e)
        }
    }
}

async fn discover(transport: &mut dyn Transport) -> Result<Vec<RemoteCapability>, TransportError> {
    transport
        .request("initialize", Some(initialize_params()))
        .await?;
    transport.notify("notifications/initialized", None).await?;
    let listed = transport.request("tools/list", None).await?;
    let listed: ListToolsResult = serde_json::from_value(listed)
        .map_err(|e| TransportError::Protocol(format!("failed to parse tools: {e}")))?;
    Ok(listed.tools)
}
