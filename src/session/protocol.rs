//! Agent 调用协议（JSON-RPC 2.0，MCP 子集）
//!
//! 会话只用到四个方法：initialize、notifications/initialized、tools/list、tools/call。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// 传输层错误；会话据此决定重连（Io / Closed / Timeout）还是直接报告（Rpc / Protocol）
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    /// 对端返回 JSON-RPC error 对象
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// 对端返回的内容不符合协议
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// 连接本身已不可用（需要重建会话）
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Closed | TransportError::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn call(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// 通知不带 id，对端不回复
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    /// 通知或服务端请求没有数字 id
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    pub fn matches(&self, id: u64) -> bool {
        self.id.as_ref().and_then(Value::as_u64) == Some(id)
    }

    /// 取出 result；error 对象转为 TransportError::Rpc
    pub fn into_result(self) -> Result<Value, TransportError> {
        if let Some(err) = self.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        self.result
            .ok_or_else(|| TransportError::Protocol("response has neither result nor error".into()))
    }
}

/// 发现握手返回的能力描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCapability {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

pub fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<RemoteCapability>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum ContentItem {
    Text { text: String },
    Resource {
        #[serde(default)]
        resource: Option<Value>,
    },
    #[serde(other)]
    Other,
}

impl CallToolResult {
    /// 拼接所有文本内容
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentItem::Text { text } => Some(text.clone()),
                ContentItem::Resource { resource: Some(r) } => {
                    r.get("text").and_then(Value::as_str).map(String::from)
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "hive",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
