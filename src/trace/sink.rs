//! 轨迹持久化
//!
//! 每次查询结束（含失败与取消）都会写一次；JsonlTraceSink 每行一个 JSON 对象：
//! `{"id", "timestamp", "query", "user_id", "status", "response", "trace"}`。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::HiveError;
use crate::trace::Trace;

#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn persist(&self, trace: &Trace) -> Result<(), HiveError>;
}

/// 追加写入 JSONL 文件；写锁保证多查询并发时行不交错
pub struct JsonlTraceSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlTraceSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TraceSink for JsonlTraceSink {
    async fn persist(&self, trace: &Trace) -> Result<(), HiveError> {
        let record = serde_json::json!({
            "id": trace.run_id,
            "status": trace.outcome,
            "timestamp": trace.ended_at.to_rfc3339(),
            "query": trace.query,
            "user_id": trace.user_id,
            "response": trace.final_answer(),
            "trace": trace,
        });
        let mut line = serde_json::to_string(&record)
            .map_err(|e| HiveError::Storage(format!("trace serialization failed: {e}")))?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                HiveError::Storage(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| HiveError::Storage(format!("cannot open {}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| HiveError::Storage(format!("trace write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| HiveError::Storage(format!("trace write failed: {e}")))
    }
}

/// 保存在内存中的轨迹（测试与嵌入式使用）
#[derive(Default)]
pub struct MemoryTraceSink {
    traces: Mutex<Vec<Trace>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn traces(&self) -> Vec<Trace> {
        self.traces.lock().await.clone()
    }
}

#[async_trait]
impl TraceSink for MemoryTraceSink {
    async fn persist(&self, trace: &Trace) -> Result<(), HiveError> {
        self.traces.lock().await.push(trace.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Action, ReasoningStep, TraceRecorder, TraceStatus};

    #[tokio::test]
    async fn test_jsonl_appends_one_line_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlTraceSink::new(dir.path().join("logs/agent_logs.jsonl"));

        for answer in ["first", "second"] {
            let mut rec = TraceRecorder::new("total sales in Europe?", "alice");
            rec.record_reasoning(ReasoningStep::new("", Action::Answer { text: answer.into() }))
                .unwrap();
            sink.persist(&rec.finish(TraceStatus::Completed)).await.unwrap();
        }

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["response"], "second");
        assert_eq!(v["user_id"], "alice");
        assert_eq!(v["status"]["status"], "completed");
        assert_eq!(v["trace"]["entries"][0]["type"], "reasoning");
    }
}
