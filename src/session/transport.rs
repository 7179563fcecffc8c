//! Agent 传输层
//!
//! - StdioTransport：启动子进程，按行收发 JSON-RPC（stdout 为响应，stderr 转入 tracing）
//! - HttpTransport：JSON-RPC over HTTP POST
//!
//! 传输对象只被持有它的 AgentSession 使用，调用方已保证同一时刻只有一个在途请求。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::manifest::{AgentDescriptor, ConnectionSpec};
use crate::session::protocol::{RpcRequest, RpcResponse, TransportError};

/// 单条连接：请求/响应 + 通知 + 关闭
#[async_trait]
pub trait Transport: Send {
    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, TransportError>;

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    /// 释放底层资源（子进程 / 连接）；重复调用无副作用
    async fn close(&mut self);
}

/// 根据描述建立连接；测试可注入内存实现
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &AgentDescriptor) -> Result<Box<dyn Transport>, TransportError>;
}

/// 默认连接器：按 ConnectionSpec 选择 stdio 或 http
#[derive(Debug, Default, Clone)]
pub struct ProcessConnector {
    http: reqwest::Client,
}

impl ProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用自定义的 HTTP 客户端（代理、TLS、超时等）
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(&self, descriptor: &AgentDescriptor) -> Result<Box<dyn Transport>, TransportError> {
        match &descriptor.connection {
            ConnectionSpec::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let transport =
                    StdioTransport::spawn(&descriptor.name, command, args, env, cwd.as_ref())?;
                Ok(Box::new(transport))
            }
            ConnectionSpec::Http { url, api_key_env } => {
                let token = api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok());
                Ok(Box::new(HttpTransport::new(
                    self.http.clone(),
                    url.clone(),
                    token,
                )))
            }
        }
    }
}

/// `${VAR}` 形式的值从当前环境展开，缺失时为空串
fn expand_env_value(key: &str, value: &str) -> String {
    match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(var) => std::env::var(var).unwrap_or_else(|_| {
            tracing::warn!(var = %var, key = %key, "Environment variable not found, using empty string");
            String::new()
        }),
        None => value.to_string(),
    }
}

/// 子进程传输
pub struct StdioTransport {
    agent: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl StdioTransport {
    pub fn spawn(
        agent: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&PathBuf>,
    ) -> Result<Self, TransportError> {
        tracing::info!(agent = %agent, command = %command, args = ?args, "Starting agent process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in env {
            cmd.env(key, expand_env_value(key, value));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Io(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("failed to get stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("failed to get stdout handle".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = agent.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(agent = %name, "{line}");
                }
            });
        }

        Ok(Self {
            agent: agent.to_string(),
            child: Some(child),
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        })
    }

    async fn write_line(&mut self, request: &RpcRequest) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        let mut line = serde_json::to_string(request)
            .map_err(|e| TransportError::Protocol(format!("failed to serialize request: {e}")))?;
        line.push('\n');
        tracing::debug!(agent = %self.agent, request = %line.trim_end(), "Sending to agent");
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(format!("failed to write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| TransportError::Io(format!("failed to flush stdin: {e}")))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id;
        self.next_id += 1;
        self.write_line(&RpcRequest::call(id, method, params)).await?;

        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| TransportError::Io(format!("read error: {e}")))?
                .ok_or(TransportError::Closed)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RpcResponse>(&line) {
                Ok(response) if response.matches(id) => return response.into_result(),
                // 日志输出、通知或过期响应
                Ok(_) => tracing::debug!(agent = %self.agent, line = %line, "Skipping unrelated message"),
                Err(_) => tracing::debug!(agent = %self.agent, line = %line, "Skipping non-JSON output"),
            }
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.write_line(&RpcRequest::notification(method, params)).await
    }

    async fn close(&mut self) {
        // 先关 stdin，让行为良好的 Agent 自行退出
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
            tracing::info!(agent = %self.agent, "Agent process stopped");
        }
    }
}

/// HTTP 传输：每个请求一次 POST，响应体为 JSON-RPC 响应
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    next_id: u64,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: String, token: Option<String>) -> Self {
        Self {
            client,
            url,
            token,
            next_id: 1,
        }
    }

    async fn post(&self, body: &RpcRequest) -> Result<reqwest::Response, TransportError> {
        let mut req = self.client.post(&self.url).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if resp.status().is_server_error() {
            return Err(TransportError::Io(format!("HTTP {}", resp.status())));
        }
        if !resp.status().is_success() {
            return Err(TransportError::Protocol(format!("HTTP {}", resp.status())));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id;
        self.next_id += 1;
        let response: RpcResponse = self
            .post(&RpcRequest::call(id, method, params))
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("invalid response body: {e}")))?;
        if !response.matches(id) {
            return Err(TransportError::Protocol(format!(
                "response id mismatch (expected {id})"
            )));
        }
        response.into_result()
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.post(&RpcRequest::notification(method, params)).await.map(|_| ())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use crate::core::HiveError;
    use crate::session::{SessionManager, SessionSettings};

    /// (Authorization 头, 请求体)
    type Seen = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    /// 最小 HTTP/1.1 服务：每个连接处理一个请求，由 respond 决定状态码和响应体
    async fn stub_server<F>(respond: F) -> (String, Seen)
    where
        F: Fn(&Value) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/rpc", listener.local_addr().unwrap());
        let seen: Seen = Arc::default();
        let respond = Arc::new(respond);
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let respond = Arc::clone(&respond);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut auth = None;
                    let mut len = 0usize;
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        let line = line.trim_end();
                        if line.is_empty() {
                            break;
                        }
                        if let Some((name, value)) = line.split_once(':') {
                            match name.trim().to_ascii_lowercase().as_str() {
                                "content-length" => len = value.trim().parse().unwrap_or(0),
                                "authorization" => auth = Some(value.trim().to_string()),
                                _ => {}
                            }
                        }
                    }
                    let mut body = vec![0u8; len];
                    if reader.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                    let (status, reply) = respond(&request);
                    log.lock().unwrap().push((auth, request));

                    let head = format!(
                        "HTTP/1.1 {status} STUB\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        reply.len()
                    );
                    let mut stream = reader.into_inner();
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(reply.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (url, seen)
    }

    fn ok(request: &Value, result: Value) -> (u16, String) {
        let reply = json!({ "jsonrpc": "2.0", "id": request["id"], "result": result });
        (200, reply.to_string())
    }

    /// 行为正常的 MCP Agent：握手、列出 add、执行 add
    fn agent_reply(request: &Value) -> (u16, String) {
        match request["method"].as_str().unwrap_or_default() {
            "initialize" => ok(request, json!({ "protocolVersion": "2024-11-05", "capabilities": {} })),
            "notifications/initialized" => (202, String::new()),
            "tools/list" => ok(
                request,
                json!({ "tools": [{ "name": "add", "description": "Add two numbers" }] }),
            ),
            "tools/call" => {
                let args = &request["params"]["arguments"];
                let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
                ok(
                    request,
                    json!({ "content": [{ "type": "text", "text": sum.to_string() }], "isError": false }),
                )
            }
            _ => (200, json!({ "jsonrpc": "2.0", "id": request["id"], "error": { "code": -32601, "message": "Method not found" } }).to_string()),
        }
    }

    fn direct_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn http_descriptor(url: &str, api_key_env: Option<&str>) -> AgentDescriptor {
        AgentDescriptor {
            name: "remote".to_string(),
            description: "remote agent".to_string(),
            connection: ConnectionSpec::Http {
                url: url.to_string(),
                api_key_env: api_key_env.map(String::from),
            },
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_http_handshake_and_call_with_bearer_token() {
        let (url, seen) = stub_server(agent_reply).await;
        std::env::set_var("HIVE_HTTP_TEST_KEY", "s3cret");
        let connector = ProcessConnector::with_http_client(direct_client());
        let mut transport = connector
            .connect(&http_descriptor(&url, Some("HIVE_HTTP_TEST_KEY")))
            .await
            .unwrap();

        let init = transport.request("initialize", None).await.unwrap();
        assert_eq!(init["protocolVersion"], "2024-11-05");
        // 通知的空响应体也算成功
        transport.notify("notifications/initialized", None).await.unwrap();
        let listed = transport.request("tools/list", None).await.unwrap();
        assert_eq!(listed["tools"][0]["name"], "add");
        let called = transport
            .request("tools/call", Some(json!({ "name": "add", "arguments": { "a": 2, "b": 3.5 } })))
            .await
            .unwrap();
        assert_eq!(called["content"][0]["text"], "5.5");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|(auth, _)| auth.as_deref() == Some("Bearer s3cret")));
        assert!(seen[1].1.get("id").is_none());
        assert_eq!(seen[3].1["id"], 3);
    }

    #[tokio::test]
    async fn test_http_without_key_sends_no_authorization() {
        let (url, seen) = stub_server(agent_reply).await;
        let mut transport = HttpTransport::new(direct_client(), url, None);
        transport.request("initialize", None).await.unwrap();
        assert!(seen.lock().unwrap()[0].0.is_none());
    }

    #[tokio::test]
    async fn test_http_rpc_error_and_id_mismatch() {
        let (url, _) = stub_server(|request: &Value| match request["method"].as_str() {
            Some("stale") => (200, json!({ "jsonrpc": "2.0", "id": 999, "result": {} }).to_string()),
            _ => agent_reply(request),
        })
        .await;
        let mut transport = HttpTransport::new(direct_client(), url, None);

        match transport.request("resources/list", None).await {
            Err(TransportError::Rpc { code, .. }) => assert_eq!(code, -32601),
            other => panic!("expected rpc error, got {other:?}"),
        }
        match transport.request("stale", None).await {
            Err(e @ TransportError::Protocol(_)) => assert!(!e.is_connection_loss()),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_status_classification() {
        let (url, _) = stub_server(|request: &Value| match request["method"].as_str() {
            Some("busy") => (503, String::new()),
            Some("bad") => (400, "{}".to_string()),
            _ => agent_reply(request),
        })
        .await;
        let mut transport = HttpTransport::new(direct_client(), url, None);

        // 5xx 视为连接问题（会话会重连），4xx 视为协议错误
        let server = transport.request("busy", None).await.unwrap_err();
        assert!(matches!(server, TransportError::Io(_)));
        assert!(server.is_connection_loss());
        let client = transport.request("bad", None).await.unwrap_err();
        assert!(matches!(client, TransportError::Protocol(_)));
        assert!(!client.is_connection_loss());
    }

    #[tokio::test]
    async fn test_http_server_error_triggers_one_reconnect() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let (url, seen) = stub_server(move |request: &Value| {
            if request["method"] == "tools/call" {
                let mut n = counter.lock().unwrap();
                *n += 1;
                if *n == 1 {
                    return (502, String::new());
                }
            }
            agent_reply(request)
        })
        .await;
        let sessions = SessionManager::new(
            vec![http_descriptor(&url, None)],
            Arc::new(ProcessConnector::with_http_client(direct_client())),
            SessionSettings::default(),
        );

        let text = sessions
            .invoke("remote", "add", json!({ "a": 1, "b": 2 }), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "3");
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(sessions.handshake_count("remote").await, 2);
        let initializes = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r)| r["method"] == "initialize")
            .count();
        assert_eq!(initializes, 2);
    }

    #[tokio::test]
    async fn test_http_unreachable_agent_is_unavailable() {
        // 绑定后立即释放端口，连接必然被拒绝
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/rpc", listener.local_addr().unwrap());
        drop(listener);
        let sessions = SessionManager::new(
            vec![http_descriptor(&url, None)],
            Arc::new(ProcessConnector::with_http_client(direct_client())),
            SessionSettings::default(),
        );
        assert!(matches!(
            sessions
                .invoke("remote", "add", json!({}), &CancellationToken::new())
                .await,
            Err(HiveError::AgentUnavailable { .. })
        ));
    }

    #[test]
    fn test_expand_env_value() {
        std::env::set_var("HIVE_TRANSPORT_TEST_VAR", "secret");
        assert_eq!(expand_env_value("K", "${HIVE_TRANSPORT_TEST_VAR}"), "secret");
        assert_eq!(expand_env_value("K", "plain"), "plain");
        assert_eq!(expand_env_value("K", "${HIVE_TRANSPORT_TEST_MISSING}"), "");
    }

    #[tokio::test]
    async fn test_spawn_missing_command_is_io_error() {
        let result = StdioTransport::spawn(
            "ghost",
            "/nonexistent/hive-agent-binary",
            &[],
            &BTreeMap::new(),
            None,
        );
        match result {
            Err(e) => assert!(e.is_connection_loss()),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
