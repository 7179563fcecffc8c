//! 能力注册表
//!
//! 合并所有 Agent 的发现结果：能力名 → 所属 Agent + input schema。
//! 构建完成后只读；重建时整体替换（SharedRegistry），并发查询不会看到半更新状态。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::HiveError;
use crate::manifest::AgentDescriptor;
use crate::session::{RemoteCapability, SessionManager};

/// 已注册能力
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// 所属 Agent 名（仅用于查找，不持有会话）
    pub agent: String,
    /// true 表示来自描述文件中的声明列表，而非实时发现
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub declared_only: bool,
}

/// 同名能力冲突：先注册者保留
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collision {
    pub capability: String,
    pub kept_agent: String,
    pub dropped_agent: String,
}

#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<Capability>,
    index: HashMap<String, usize>,
    collisions: Vec<Collision>,
    /// (agent, reason)：发现失败且无声明能力
    unavailable: Vec<(String, String)>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 对每个 Agent 执行发现握手（并发），按清单顺序合并
    pub async fn build(manager: &SessionManager) -> Self {
        let results = join_all(
            manager
                .descriptors()
                .iter()
                .map(|d| async move { manager.discover(&d.name).await }),
        )
        .await;
        Self::from_discovery(manager.descriptors().iter().map(Arc::as_ref).zip(results))
    }

    /// 重建：在现有会话上重新拉取能力列表，不重复握手
    pub async fn rebuild(manager: &SessionManager) -> Self {
        let results = join_all(
            manager
                .descriptors()
                .iter()
                .map(|d| async move { manager.rediscover(&d.name).await }),
        )
        .await;
        Self::from_discovery(manager.descriptors().iter().map(Arc::as_ref).zip(results))
    }

    /// 不连接 Agent，只用描述文件中的声明列表（会话在首次调用时建立）
    pub fn from_declared(descriptors: &[Arc<AgentDescriptor>]) -> Self {
        Self::from_discovery(descriptors.iter().map(|d| {
            (
                d.as_ref(),
                Err(HiveError::agent_unavailable(&d.name, "discovery deferred until first call")),
            )
        }))
    }

    pub fn from_discovery<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = (&'a AgentDescriptor, Result<Vec<RemoteCapability>, HiveError>)>,
    {
        let mut registry = Self::new();
        for (descriptor, result) in results {
            match result {
                Ok(caps) => {
                    for cap in caps {
                        registry.insert(Capability {
                            description: cap.description.unwrap_or_default(),
                            name: cap.name,
                            input_schema: cap.input_schema,
                            agent: descriptor.name.clone(),
                            declared_only: false,
                        });
                    }
                }
                Err(e) if !descriptor.tools.is_empty() => {
                    tracing::warn!(
                        agent = %descriptor.name,
                        error = %e,
                        declared = descriptor.tools.len(),
                        "Live discovery unavailable, using declared capabilities"
                    );
                    for name in &descriptor.tools {
                        registry.insert(Capability {
                            name: name.clone(),
                            description: format!("Provided by {}", descriptor.name),
                            input_schema: serde_json::json!({ "type": "object" }),
                            agent: descriptor.name.clone(),
                            declared_only: true,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(agent = %descriptor.name, error = %e, "Agent contributes no capabilities");
                    registry
                        .unavailable
                        .push((descriptor.name.clone(), e.to_string()));
                }
            }
        }
        tracing::info!(
            capabilities = registry.capabilities.len(),
            collisions = registry.collisions.len(),
            "Capability registry built"
        );
        registry
    }

    /// 注册单个能力；同名时保留已有的并记录冲突
    pub fn insert(&mut self, capability: Capability) {
        if let Some(&idx) = self.index.get(&capability.name) {
            let kept = &self.capabilities[idx];
            tracing::warn!(
                capability = %capability.name,
                kept = %kept.agent,
                dropped = %capability.agent,
                "Capability name collision, keeping first registration"
            );
            self.collisions.push(Collision {
                capability: capability.name,
                kept_agent: kept.agent.clone(),
                dropped_agent: capability.agent,
            });
            return;
        }
        self.index
            .insert(capability.name.clone(), self.capabilities.len());
        self.capabilities.push(capability);
    }

    pub fn resolve(&self, name: &str) -> Result<&Capability, HiveError> {
        self.index
            .get(name)
            .map(|&idx| &self.capabilities[idx])
            .ok_or_else(|| HiveError::UnknownCapability(name.to_string()))
    }

    /// 按 Agent 清单顺序、再按发现顺序
    pub fn list_all(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn names(&self) -> Vec<String> {
        self.capabilities.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    pub fn unavailable_agents(&self) -> &[(String, String)] {
        &self.unavailable
    }

    /// 决策后端看到的能力菜单（JSON 数组）
    pub fn menu_json(&self) -> String {
        let menu: Vec<Value> = self
            .capabilities
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "description": c.description,
                    "agent": c.agent,
                    "parameters": c.input_schema
                })
            })
            .collect();
        serde_json::to_string_pretty(&menu).unwrap_or_else(|_| "[]".to_string())
    }
}

/// 可整体替换的注册表句柄；查询持有快照，重建不影响在途查询
#[derive(Debug, Default)]
pub struct SharedRegistry {
    inner: RwLock<Arc<CapabilityRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self {
            inner: RwLock::new(Arc::new(registry)),
        }
    }

    pub async fn snapshot(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&*self.inner.read().await)
    }

    pub async fn replace(&self, registry: CapabilityRegistry) -> Arc<CapabilityRegistry> {
        let registry = Arc::new(registry);
        *self.inner.write().await = Arc::clone(&registry);
        registry
    }

    pub async fn rebuild(&self, manager: &SessionManager) -> Arc<CapabilityRegistry> {
        self.replace(CapabilityRegistry::rebuild(manager).await).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ConnectionSpec;
    use crate::session::{LocalAgent, LocalConnector, SessionSettings};
    use serde_json::json;

    fn descriptor(name: &str, tools: &[&str]) -> AgentDescriptor {
        AgentDescriptor {
            name: name.to_string(),
            description: String::new(),
            connection: ConnectionSpec::Http {
                url: "http://unused".to_string(),
                api_key_env: None,
            },
            tools: tools.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn remote(name: &str) -> RemoteCapability {
        RemoteCapability {
            name: name.to_string(),
            description: Some(format!("{name} description")),
            input_schema: json!({"type": "object", "properties": {"region": {"type": "string"}}}),
        }
    }

    #[test]
    fn test_resolve_matches_list_all() {
        let inventory = descriptor("inventory", &[]);
        let forecast = descriptor("forecast", &[]);
        let registry = CapabilityRegistry::from_discovery(vec![
            (&inventory, Ok(vec![remote("stock_level"), remote("low_stock")])),
            (&forecast, Ok(vec![remote("forecast_demand")])),
        ]);

        assert_eq!(
            registry.names(),
            vec!["stock_level", "low_stock", "forecast_demand"]
        );
        for cap in registry.list_all() {
            let resolved = registry.resolve(&cap.name).unwrap();
            assert_eq!(resolved.input_schema, remote(&cap.name).input_schema);
            assert_eq!(resolved.agent, cap.agent);
        }
        assert!(matches!(
            registry.resolve("nope"),
            Err(HiveError::UnknownCapability(_))
        ));
    }

    #[test]
    fn test_collision_first_wins() {
        let a = descriptor("a", &[]);
        let b = descriptor("b", &[]);
        let registry = CapabilityRegistry::from_discovery(vec![
            (&a, Ok(vec![remote("total_sales")])),
            (&b, Ok(vec![remote("total_sales"), remote("other")])),
        ]);
        assert_eq!(registry.resolve("total_sales").unwrap().agent, "a");
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.collisions(),
            &[Collision {
                capability: "total_sales".to_string(),
                kept_agent: "a".to_string(),
                dropped_agent: "b".to_string(),
            }]
        );
    }

    #[test]
    fn test_declared_fallback_and_unavailable() {
        let supply = descriptor("supply", &["delay_stats"]);
        let dead = descriptor("dead", &[]);
        let registry = CapabilityRegistry::from_discovery(vec![
            (&supply, Err(HiveError::agent_unavailable("supply", "spawn failed"))),
            (&dead, Err(HiveError::agent_unavailable("dead", "spawn failed"))),
        ]);
        let cap = registry.resolve("delay_stats").unwrap();
        assert!(cap.declared_only);
        assert_eq!(cap.agent, "supply");
        assert_eq!(registry.unavailable_agents().len(), 1);
        assert_eq!(registry.unavailable_agents()[0].0, "dead");
    }

    #[tokio::test]
    async fn test_build_and_shared_rebuild() {
        let connector = LocalConnector::new()
            .agent(
                "sales",
                LocalAgent::new().tool("total_sales", "Total", json!({"type": "object"}), |_| {
                    Ok("1".into())
                }),
            )
            .agent(
                "echo",
                LocalAgent::new().tool("echo", "Echo", json!({"type": "object"}), |a| {
                    Ok(a.to_string())
                }),
            );
        let manager = SessionManager::new(
            vec![descriptor("sales", &[]), descriptor("echo", &[])],
            Arc::new(connector.clone()),
            SessionSettings::default(),
        );

        let shared = SharedRegistry::new(CapabilityRegistry::build(&manager).await);
        let before = shared.snapshot().await;
        assert_eq!(before.names(), vec!["total_sales", "echo"]);

        let after = shared.rebuild(&manager).await;
        assert_eq!(after.names(), before.names());
        assert!(!Arc::ptr_eq(&before, &after));
        // 重建不重复握手
        assert_eq!(manager.handshake_count("sales").await, 1);
        assert_eq!(connector.connect_count("echo"), 1);
    }
}
