//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按脚本依次返回预设回复；脚本为空时退化为直接回答最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

/// Mock 客户端：按顺序吐出脚本回复，并记录每次收到的消息
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<String>>,
    scripted: bool,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    /// 无脚本：回显模式
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(replies.into_iter().map(Into::into).collect()),
            scripted: true,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 每次 complete 收到的完整消息序列
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }

        if self.scripted {
            return self
                .script
                .lock()
                .ok()
                .and_then(|mut s| s.pop_front())
                .ok_or(LlmError::ScriptExhausted);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(serde_json::json!({
            "thought": "Mock backend answers directly.",
            "answer": format!("Echo from Mock: {last_user}")
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let mock = MockLlmClient::scripted(["first", "second"]);
        let msgs = vec![Message::user("hi")];
        assert_eq!(mock.complete(&msgs).await.unwrap(), "first");
        assert_eq!(mock.complete(&msgs).await.unwrap(), "second");
        assert!(matches!(
            mock.complete(&msgs).await,
            Err(LlmError::ScriptExhausted)
        ));
        assert_eq!(mock.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_echo_mode_answers() {
        let mock = MockLlmClient::new();
        let out = mock
            .complete(&[Message::system("sys"), Message::user("total sales in Europe")])
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(v["answer"].as_str().unwrap().contains("total sales in Europe"));
    }
}
