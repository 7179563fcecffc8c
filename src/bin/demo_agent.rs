//! 演示 Agent：stdio 上的 JSON-RPC 服务，提供几个确定性的能力
//!
//! 配合 config/agents/demo.toml 使用，也被集成测试直接拉起。
//! stdout 只写协议帧，日志写 stderr。

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use hive::observability;
use hive::session::protocol::PROTOCOL_VERSION;

/// 每个地区、每年的销售额（单位：千）
const SALES: &[(&str, i64, f64)] = &[
    ("europe", 2023, 1240.0),
    ("europe", 2024, 1385.5),
    ("asia", 2023, 2210.0),
    ("asia", 2024, 2496.25),
    ("north america", 2023, 1980.0),
    ("north america", 2024, 2044.75),
];

#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

fn tools() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Return the given text unchanged",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        },
        {
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": { "type": "number" },
                    "b": { "type": "number" }
                },
                "required": ["a", "b"]
            }
        },
        {
            "name": "regional_sales",
            "description": "Total sales for a region, optionally for one year",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "region": { "type": "string" },
                    "year": { "type": "integer" }
                },
                "required": ["region"]
            }
        }
    ])
}

fn call_tool(name: &str, args: &Value) -> Result<String, String> {
    match name {
        "echo" => args
            .get("text")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| "missing 'text'".to_string()),
        "add" => {
            let a = args.get("a").and_then(Value::as_f64).ok_or("missing 'a'")?;
            let b = args.get("b").and_then(Value::as_f64).ok_or("missing 'b'")?;
            Ok(format_number(a + b))
        }
        "regional_sales" => {
            let region = args
                .get("region")
                .and_then(Value::as_str)
                .map(|r| r.trim().to_lowercase())
                .filter(|r| !r.is_empty())
                .ok_or("missing 'region'")?;
            let year = args.get("year").and_then(Value::as_i64);
            let rows: Vec<_> = SALES
                .iter()
                .filter(|(r, y, _)| *r == region && year.map_or(true, |want| want == *y))
                .collect();
            if rows.is_empty() {
                return Err(format!("no sales data for region '{region}'"));
            }
            let total: f64 = rows.iter().map(|(_, _, v)| v).sum();
            Ok(match year {
                Some(y) => format!("Sales for {region} in {y}: {}", format_number(total)),
                None => format!("Total sales for {region}: {}", format_number(total)),
            })
        }
        other => Err(format!("unknown tool '{other}'")),
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// 处理一条请求；通知返回 None
fn handle(msg: Incoming) -> Option<Value> {
    let id = msg.id?;
    let params = msg.params.unwrap_or(Value::Null);
    let result = match msg.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "hive-demo-agent", "version": env!("CARGO_PKG_VERSION") }
        })),
        "tools/list" => Ok(json!({ "tools": tools() })),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            tracing::debug!(tool = name, "tools/call");
            Ok(match call_tool(name, &args) {
                Ok(text) => json!({ "content": [{ "type": "text", "text": text }], "isError": false }),
                Err(text) => json!({ "content": [{ "type": "text", "text": text }], "isError": true }),
            })
        }
        "ping" => Ok(json!({})),
        other => Err((-32601, format!("Method not found: {other}"))),
    };
    Some(match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => {
            json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init("warn", false);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Incoming>(&line) {
            Ok(msg) => handle(msg),
            Err(e) => Some(json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": format!("Parse error: {e}") }
            })),
        };
        if let Some(reply) = reply {
            let mut frame = reply.to_string();
            frame.push('\n');
            stdout.write_all(frame.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
