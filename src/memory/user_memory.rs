//! 用户记忆：在 MemoryStore 之上提供按用户串行化的读-改-写
//!
//! 约定的键：
//! - `last_call_args`：`{capability: {arg: value}}`，每次成功调用后写入
//! - `query_history`：最近的查询文本，保留 history_limit 条
//!
//! 同一用户的 modify 在用户锁上排队，不同用户互不阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::store::{MemoryRecord, MemoryStore};
use crate::core::HiveError;
use crate::registry::schema::property_names;

pub const LAST_CALL_ARGS: &str = "last_call_args";
pub const QUERY_HISTORY: &str = "query_history";

pub struct UserMemory {
    store: Arc<dyn MemoryStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    history_limit: usize,
}

impl UserMemory {
    pub fn new(store: Arc<dyn MemoryStore>, history_limit: usize) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            history_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// 获取用户锁；持有期间其他对同一用户的 modify 会等待
    ///
    /// 无人持有也无人等待的锁（引用计数为 1）顺带清理。
    pub async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(user_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub async fn get(&self, user_id: &str) -> Result<MemoryRecord, HiveError> {
        self.store.get(user_id).await
    }

    /// 在用户锁内读取 key 当前值、计算新值并写回，返回写入的值
    pub async fn modify<F>(&self, user_id: &str, key: &str, f: F) -> Result<Value, HiveError>
    where
        F: FnOnce(Option<Value>) -> Value + Send,
    {
        let _guard = self.lock_user(user_id).await;
        let current = self.store.get(user_id).await?.remove(key);
        let next = f(current);
        self.store.update(user_id, key, next.clone()).await?;
        Ok(next)
    }

    /// 记录某能力最近一次使用的参数
    pub async fn record_call_args(
        &self,
        user_id: &str,
        capability: &str,
        arguments: &Value,
    ) -> Result<(), HiveError> {
        let arguments = arguments.clone();
        let capability = capability.to_string();
        self.modify(user_id, LAST_CALL_ARGS, move |current| {
            let mut per_capability = match current {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            per_capability.insert(capability, arguments);
            Value::Object(per_capability)
        })
        .await
        .map(|_| ())
    }

    /// 追加一条查询历史，超出上限时丢弃最旧的
    pub async fn record_query(&self, user_id: &str, query: &str) -> Result<(), HiveError> {
        let limit = self.history_limit;
        let query = Value::String(query.to_string());
        self.modify(user_id, QUERY_HISTORY, move |current| {
            let mut history = match current {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            history.push(query);
            if history.len() > limit {
                history.drain(..history.len() - limit);
            }
            Value::Array(history)
        })
        .await
        .map(|_| ())
    }

    /// 用记忆中的上次参数补全缺失或空白的参数，返回补全后的参数和被补全的键
    ///
    /// 查找顺序：`last_call_args[capability][key]`，再到 `last_call_args[key]`（扁平布局）。
    /// 缺失的键只有在 schema 中声明时才补。
    pub fn backfill(
        record: &MemoryRecord,
        capability: &str,
        schema: &Value,
        arguments: Value,
    ) -> (Value, Vec<String>) {
        let Some(last) = record.get(LAST_CALL_ARGS).and_then(Value::as_object) else {
            return (arguments, Vec::new());
        };
        let per_capability = last.get(capability).and_then(Value::as_object);
        let remembered = |key: &str| -> Option<Value> {
            per_capability
                .and_then(|m| m.get(key))
                .filter(|v| !is_blank(v))
                .or_else(|| last.get(key).filter(|v| !v.is_object() && !is_blank(v)))
                .cloned()
        };

        let mut args = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return (other, Vec::new()),
        };
        let mut filled = Vec::new();

        let blank_keys: Vec<String> = args
            .iter()
            .filter(|(_, v)| is_blank(v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in blank_keys {
            if let Some(v) = remembered(&key) {
                args.insert(key.clone(), v);
                filled.push(key);
            }
        }
        for key in property_names(schema) {
            if args.contains_key(&key) {
                continue;
            }
            if let Some(v) = remembered(&key) {
                args.insert(key.clone(), v);
                filled.push(key);
            }
        }
        (Value::Object(args), filled)
    }

    /// 渲染给决策后端的记忆上下文；无记录时为 None
    pub fn render_context(record: &MemoryRecord) -> Option<String> {
        if record.is_empty() {
            return None;
        }
        let mut lines = Vec::new();
        if let Some(history) = record.get(QUERY_HISTORY).and_then(Value::as_array) {
            let recent: Vec<&str> = history.iter().filter_map(Value::as_str).collect();
            if !recent.is_empty() {
                lines.push(format!("Recent queries: {}", recent.join(" | ")));
            }
        }
        if let Some(last) = record.get(LAST_CALL_ARGS) {
            lines.push(format!("Last arguments used: {last}"));
        }
        for (key, value) in record {
            if key != QUERY_HISTORY && key != LAST_CALL_ARGS {
                lines.push(format!("{key}: {value}"));
            }
        }
        Some(lines.join("\n"))
    }
}

/// null、空串或全空白串
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use serde_json::json;

    fn record(v: Value) -> MemoryRecord {
        v.as_object().cloned().unwrap()
    }

    fn region_schema() -> Value {
        json!({"type": "object", "properties": {"region": {"type": "string"}, "top_n": {"type": "integer"}}})
    }

    #[test]
    fn test_backfill_flat_layout() {
        let rec = record(json!({"last_call_args": {"region": "Europe"}}));
        let (args, filled) =
            UserMemory::backfill(&rec, "total_sales", &region_schema(), json!({"region": ""}));
        assert_eq!(args, json!({"region": "Europe"}));
        assert_eq!(filled, vec!["region"]);
    }

    #[test]
    fn test_backfill_per_capability_wins() {
        let rec = record(json!({"last_call_args": {
            "region": "Europe",
            "total_sales": {"region": "Asia", "top_n": 5}
        }}));
        let (args, filled) =
            UserMemory::backfill(&rec, "total_sales", &region_schema(), json!({"region": null}));
        assert_eq!(args, json!({"region": "Asia", "top_n": 5}));
        assert_eq!(filled.len(), 2);
    }

    #[test]
    fn test_backfill_keeps_explicit_values() {
        let rec = record(json!({"last_call_args": {"total_sales": {"region": "Asia"}}}));
        let (args, filled) = UserMemory::backfill(
            &rec,
            "total_sales",
            &region_schema(),
            json!({"region": "Americas"}),
        );
        assert_eq!(args["region"], "Americas");
        assert!(filled.is_empty());
    }

    #[test]
    fn test_backfill_ignores_undeclared_keys() {
        let rec = record(json!({"last_call_args": {"x": {"secret": "s", "region": "Asia"}}}));
        let (args, _) = UserMemory::backfill(
            &rec,
            "x",
            &json!({"type": "object", "properties": {"region": {}}}),
            json!({}),
        );
        assert_eq!(args, json!({"region": "Asia"}));
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let memory = UserMemory::new(Arc::new(InMemoryStore::new()), 2);
        for q in ["a", "b", "c"] {
            memory.record_query("alice", q).await.unwrap();
        }
        let rec = memory.get("alice").await.unwrap();
        assert_eq!(rec[QUERY_HISTORY], json!(["b", "c"]));
        assert!(UserMemory::render_context(&rec).unwrap().contains("b | c"));
    }

    #[tokio::test]
    async fn test_concurrent_modify_loses_no_update() {
        let memory = Arc::new(UserMemory::new(Arc::new(InMemoryStore::new()), 10));
        let mut handles = Vec::new();
        for i in 0..20 {
            let memory = Arc::clone(&memory);
            handles.push(tokio::spawn(async move {
                memory
                    .record_call_args("alice", &format!("cap_{i}"), &json!({"i": i}))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let rec = memory.get("alice").await.unwrap();
        assert_eq!(rec[LAST_CALL_ARGS].as_object().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_idle_user_locks_are_pruned() {
        let memory = UserMemory::new(Arc::new(InMemoryStore::new()), 10);
        for i in 0..50 {
            memory.record_query(&format!("user_{i}"), "q").await.unwrap();
        }
        // 只剩最近一次使用的那把
        assert_eq!(memory.locks.lock().await.len(), 1);

        let held = memory.lock_user("bob").await;
        memory.record_query("carol", "q").await.unwrap();
        assert!(memory.locks.lock().await.contains_key("bob"));
        drop(held);
    }
}
