//! 构建器：从 AppConfig 组装 SessionManager、注册表、决策后端、记忆与轨迹持久化
//!
//! CLI / Web / 测试共用同一套初始化逻辑；各组件都可以注入替身。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, LlmSection};
use crate::core::HiveError;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::manifest::{self, AgentDescriptor};
use crate::memory::{InMemoryStore, JsonFileStore, MemoryStore, UserMemory};
use crate::react::{
    DecisionBackend, Orchestrator, OrchestratorSettings, PatternPreclassifier, Planner,
    DEFAULT_SYSTEM_PROMPT,
};
use crate::registry::{CapabilityRegistry, SharedRegistry};
use crate::session::{Connector, ProcessConnector, SessionManager, SessionSettings};
use crate::trace::{JsonlTraceSink, TraceSink};

const AZURE_DEFAULT_API_VERSION: &str = "2024-06-01";

/// 按 [llm] 配置创建客户端；缺少 API Key 时回落到 Mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.timeouts.request.max(1));
    let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
        "azure" => {
            let key = env("AZURE_OPENAI_API_KEY");
            let endpoint = cfg.base_url.clone().or_else(|| env("AZURE_OPENAI_ENDPOINT"));
            match (key, endpoint) {
                (Some(key), Some(endpoint)) => {
                    let deployment = cfg.deployment.clone().unwrap_or_else(|| cfg.model.clone());
                    let api_version = cfg
                        .api_version
                        .clone()
                        .or_else(|| env("AZURE_OPENAI_API_VERSION"))
                        .unwrap_or_else(|| AZURE_DEFAULT_API_VERSION.to_string());
                    tracing::info!("Using Azure OpenAI ({} @ {})", deployment, endpoint);
                    Arc::new(
                        OpenAiClient::azure(&endpoint, &deployment, &api_version, &key)
                            .temperature(cfg.temperature)
                            .timeout(timeout),
                    )
                }
                _ => {
                    tracing::warn!("AZURE_OPENAI_API_KEY or endpoint not set, using Mock LLM");
                    Arc::new(MockLlmClient::new())
                }
            }
        }
        "deepseek" => match env("DEEPSEEK_API_KEY") {
            Some(key) => {
                // [llm].model 仍是 OpenAI 默认值时改用 deepseek-chat
                let model = (cfg.model != "gpt-4o-mini").then_some(cfg.model.as_str());
                let client = OpenAiClient::deepseek(model, &key)
                    .temperature(cfg.temperature)
                    .timeout(timeout);
                tracing::info!("Using DeepSeek LLM ({})", client.model());
                Arc::new(client)
            }
            None => {
                tracing::warn!("DEEPSEEK_API_KEY not set, using Mock LLM");
                Arc::new(MockLlmClient::new())
            }
        },
        _ => match env("OPENAI_API_KEY") {
            Some(key) => {
                tracing::info!("Using OpenAI LLM ({})", cfg.model);
                Arc::new(
                    OpenAiClient::openai(cfg.base_url.as_deref(), &cfg.model, &key)
                        .temperature(cfg.temperature)
                        .timeout(timeout),
                )
            }
            None => {
                tracing::warn!("No API key set or provider unknown, using Mock LLM");
                Arc::new(MockLlmClient::new())
            }
        },
    }
}

/// 读取系统提示词：显式路径 > config/prompts/system.md > 内置默认
pub fn load_system_prompt(path: Option<&Path>) -> String {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![p.to_path_buf()],
        None => vec![
            PathBuf::from("config/prompts/system.md"),
            PathBuf::from("../config/prompts/system.md"),
        ],
    };
    candidates
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

/// 组装完成的运行时
pub struct Hive {
    pub config: AppConfig,
    pub sessions: Arc<SessionManager>,
    pub registry: Arc<SharedRegistry>,
    pub memory: Arc<UserMemory>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Hive {
    /// 对所有 Agent 重新发现并整体替换注册表
    pub async fn refresh_registry(&self) -> Arc<CapabilityRegistry> {
        self.registry.rebuild(&self.sessions).await
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}

pub struct HiveBuilder {
    config: AppConfig,
    descriptors: Option<Vec<AgentDescriptor>>,
    connector: Option<Arc<dyn Connector>>,
    backend: Option<Arc<dyn DecisionBackend>>,
    memory_store: Option<Arc<dyn MemoryStore>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    system_prompt: Option<String>,
}

impl HiveBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            descriptors: None,
            connector: None,
            backend: None,
            memory_store: None,
            trace_sink: None,
            system_prompt: None,
        }
    }

    /// 不从 manifest 目录加载，直接使用给定描述
    pub fn with_descriptors(mut self, descriptors: Vec<AgentDescriptor>) -> Self {
        self.descriptors = Some(descriptors);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn DecisionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 加载清单、预热注册表并组装编排器；没有任何可用能力时返回 Configuration 错误
    pub async fn build(self) -> Result<Hive, HiveError> {
        let config = self.config;
        let descriptors = match self.descriptors {
            Some(d) => d,
            None => manifest::load(&config.agents.manifest_dir)?,
        };
        if descriptors.is_empty() {
            return Err(HiveError::Configuration("no agents configured".into()));
        }

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(ProcessConnector::new()));
        let sessions = Arc::new(SessionManager::new(
            descriptors,
            connector,
            SessionSettings::from(&config.agents),
        ));

        let registry = if config.agents.eager_connect {
            CapabilityRegistry::build(&sessions).await
        } else {
            CapabilityRegistry::from_declared(sessions.descriptors())
        };
        if registry.is_empty() {
            return Err(HiveError::Configuration(
                "no capabilities available from any agent".into(),
            ));
        }
        let registry = Arc::new(SharedRegistry::new(registry));

        let backend: Arc<dyn DecisionBackend> = match self.backend {
            Some(b) => b,
            None => Arc::new(Planner::new(create_llm_from_config(&config.llm))),
        };

        let store: Arc<dyn MemoryStore> = match self.memory_store {
            Some(s) => s,
            None if config.app.memory_path.as_os_str().is_empty() => Arc::new(InMemoryStore::new()),
            None => Arc::new(JsonFileStore::open(&config.app.memory_path).await?),
        };
        let memory = Arc::new(UserMemory::new(store, config.orchestrator.history_limit));

        let system_prompt = self
            .system_prompt
            .unwrap_or_else(|| load_system_prompt(config.app.system_prompt_path.as_deref()));
        let settings = OrchestratorSettings {
            max_cycles: config.orchestrator.effective_max_cycles(),
            default_deadline: config.orchestrator.query_timeout_secs.map(Duration::from_secs),
            system_prompt,
        };

        let mut orchestrator = Orchestrator::new(
            Arc::clone(&sessions),
            Arc::clone(&registry),
            backend,
            settings,
        )
        .with_memory(Arc::clone(&memory));

        let sink: Option<Arc<dyn TraceSink>> = match self.trace_sink {
            Some(s) => Some(s),
            None if config.app.trace_log.as_os_str().is_empty() => None,
            None => Some(Arc::new(JsonlTraceSink::new(config.app.trace_log.clone()))),
        };
        if let Some(sink) = sink {
            orchestrator = orchestrator.with_trace_sink(sink);
        }
        if !config.orchestrator.hints.is_empty() {
            let pre = PatternPreclassifier::new(&config.orchestrator.hints)?;
            orchestrator = orchestrator.with_preclassifier(Arc::new(pre));
        }

        Ok(Hive {
            config,
            sessions,
            registry,
            memory,
            orchestrator: Arc::new(orchestrator),
        })
    }
}
