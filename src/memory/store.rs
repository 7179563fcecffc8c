//! 用户记忆存储：get / update / append_to_list，按 user_id 分区
//!
//! 单个操作在存储内部是原子的；跨操作的读-改-写由 UserMemory 的用户锁串行化。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::core::HiveError;

pub type MemoryRecord = Map<String, Value>;

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 用户记录；不存在时为空
    async fn get(&self, user_id: &str) -> Result<MemoryRecord, HiveError>;

    async fn update(&self, user_id: &str, key: &str, value: Value) -> Result<(), HiveError>;

    /// key 不存在时创建列表；已存在但不是列表时报错
    async fn append_to_list(&self, user_id: &str, key: &str, value: Value) -> Result<(), HiveError>;
}

fn append(record: &mut MemoryRecord, key: &str, value: Value) -> Result<(), HiveError> {
    match record
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(items) => {
            items.push(value);
            Ok(())
        }
        other => Err(HiveError::Memory(format!(
            "key '{key}' holds a non-list value: {other}"
        ))),
    }
}

/// 纯内存存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    users: RwLock<HashMap<String, MemoryRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn get(&self, user_id: &str) -> Result<MemoryRecord, HiveError> {
        Ok(self.users.read().await.get(user_id).cloned().unwrap_or_default())
    }

    async fn update(&self, user_id: &str, key: &str, value: Value) -> Result<(), HiveError> {
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn append_to_list(&self, user_id: &str, key: &str, value: Value) -> Result<(), HiveError> {
        let mut users = self.users.write().await;
        append(users.entry(user_id.to_string()).or_default(), key, value)
    }
}

/// JSON 文件存储：整个文件是 `{user_id: {key: value}}`，每次修改后整体写回
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    users: RwLock<HashMap<String, MemoryRecord>>,
}

impl JsonFileStore {
    /// 文件不存在时从空记录开始；内容损坏时报错
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, HiveError> {
        let path = path.into();
        let users = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                HiveError::Memory(format!("corrupt memory file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(HiveError::Memory(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        tracing::debug!(path = %path.display(), users = users.len(), "Memory store opened");
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 写临时文件再 rename，崩溃时不留下半个文件
    async fn save(&self, users: &HashMap<String, MemoryRecord>) -> Result<(), HiveError> {
        let content = serde_json::to_string_pretty(users)
            .map_err(|e| HiveError::Memory(format!("serialization failed: {e}")))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HiveError::Memory(format!("cannot create {}: {e}", parent.display())))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| HiveError::Memory(format!("cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| HiveError::Memory(format!("cannot replace {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl MemoryStore for JsonFileStore {
    async fn get(&self, user_id: &str) -> Result<MemoryRecord, HiveError> {
        Ok(self.users.read().await.get(user_id).cloned().unwrap_or_default())
    }

    // 在副本上修改，落盘成功后才替换缓存
    async fn update(&self, user_id: &str, key: &str, value: Value) -> Result<(), HiveError> {
        let mut users = self.users.write().await;
        let mut next = users.clone();
        next.entry(user_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.save(&next).await?;
        *users = next;
        Ok(())
    }

    async fn append_to_list(&self, user_id: &str, key: &str, value: Value) -> Result<(), HiveError> {
        let mut users = self.users.write().await;
        let mut next = users.clone();
        append(next.entry(user_id.to_string()).or_default(), key, value)?;
        self.save(&next).await?;
        *users = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_basic() {
        let store = InMemoryStore::new();
        assert!(store.get("alice").await.unwrap().is_empty());
        store.update("alice", "region", json!("Europe")).await.unwrap();
        store.append_to_list("alice", "queries", json!("q1")).await.unwrap();
        store.append_to_list("alice", "queries", json!("q2")).await.unwrap();

        let record = store.get("alice").await.unwrap();
        assert_eq!(record["region"], "Europe");
        assert_eq!(record["queries"], json!(["q1", "q2"]));
        assert!(store.get("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_to_scalar_fails() {
        let store = InMemoryStore::new();
        store.update("alice", "region", json!("Europe")).await.unwrap();
        assert!(matches!(
            store.append_to_list("alice", "region", json!("x")).await,
            Err(HiveError::Memory(_))
        ));
    }

    #[tokio::test]
    async fn test_json_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/user_memory.json");
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store
                .update("alice", "last_call_args", json!({"total_sales": {"region": "Asia"}}))
                .await
                .unwrap();
            store.append_to_list("alice", "query_history", json!("sales?")).await.unwrap();
        }
        let store = JsonFileStore::open(&path).await.unwrap();
        let record = store.get("alice").await.unwrap();
        assert_eq!(record["last_call_args"]["total_sales"]["region"], "Asia");
        assert_eq!(record["query_history"], json!(["sales?"]));
    }

    #[tokio::test]
    async fn test_json_file_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(HiveError::Memory(_))
        ));
    }

    #[tokio::test]
    async fn test_json_file_failed_save_leaves_cache_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        store.update("alice", "region", json!("Europe")).await.unwrap();

        // 临时文件位置被目录占住，写入必然失败
        std::fs::create_dir(dir.path().join("memory.json.tmp")).unwrap();
        assert!(matches!(
            store.update("alice", "region", json!("Asia")).await,
            Err(HiveError::Memory(_))
        ));
        assert!(store.append_to_list("alice", "queries", json!("q")).await.is_err());

        let record = store.get("alice").await.unwrap();
        assert_eq!(record["region"], "Europe");
        assert!(!record.contains_key("queries"));
    }
}
