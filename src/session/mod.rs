//! Agent 会话层
//!
//! - **protocol**: JSON-RPC 2.0 请求/响应与能力描述
//! - **transport**: Transport / Connector 抽象，stdio 子进程与 HTTP 实现
//! - **session**: 单 Agent 会话状态机与发现握手
//! - **manager**: SessionManager，按 Agent 名调用能力
//! - **local**: 进程内 Agent（闭包实现能力）

pub mod local;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;

pub use local::{LocalAgent, LocalConnector};
pub use manager::{SessionManager, SessionSettings};
pub use protocol::{RemoteCapability, TransportError};
pub use session::{AgentSession, SessionState};
pub use transport::{Connector, HttpTransport, ProcessConnector, StdioTransport, Transport};
