//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub agents: AgentsSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub web: WebSection,
}

/// [app] 段：应用名、系统提示词、审计日志与用户记忆路径
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 系统提示词文件，未设置时依次查找 config/prompts/system.md
    pub system_prompt_path: Option<PathBuf>,
    /// 每次查询的 Trace 追加到此 JSONL 文件
    #[serde(default = "default_trace_log")]
    pub trace_log: PathBuf,
    /// 用户记忆 JSON 文件；为空字符串时只保存在内存中
    #[serde(default = "default_memory_path")]
    pub memory_path: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt_path: None,
            trace_log: default_trace_log(),
            memory_path: default_memory_path(),
        }
    }
}

fn default_trace_log() -> PathBuf {
    PathBuf::from("logs/agent_logs.jsonl")
}

fn default_memory_path() -> PathBuf {
    PathBuf::from("logs/user_memory.json")
}

/// [llm] 段：决策后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / azure / deepseek / mock；API Key 缺失时回落到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// Azure OpenAI 的 api-version
    pub api_version: Option<String>,
    /// Azure OpenAI 的 deployment 名，未设置时使用 model
    pub deployment: Option<String>,
    pub temperature: Option<f32>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_version: None,
            deployment: None,
            temperature: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [agents] 段：描述文件目录、连接策略、调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsSection {
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
    /// true 时启动即建立全部会话；false 时首次使用才连接
    #[serde(default = "default_eager_connect")]
    pub eager_connect: bool,
    /// 单次能力调用超时（秒）
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// 连接 + 发现握手超时（秒）
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            manifest_dir: default_manifest_dir(),
            eager_connect: default_eager_connect(),
            call_timeout_secs: default_call_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("config/agents")
}

fn default_eager_connect() -> bool {
    true
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    15
}

/// [orchestrator] 段：循环上限、默认截止时间、历史条数、预分类规则
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 决策/工具循环的最大轮数
    #[serde(default = "default_max_cycles")]
    pub max_cycles: usize,
    /// 单次查询的默认截止时间（秒），未设置时不限
    pub query_timeout_secs: Option<u64>,
    /// 用户记忆中保留的最近查询条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub hints: Vec<HintRule>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            query_timeout_secs: None,
            history_limit: default_history_limit(),
            hints: Vec::new(),
        }
    }
}

fn default_max_cycles() -> usize {
    8
}

fn default_history_limit() -> usize {
    10
}

/// [[orchestrator.hints]]：查询命中 pattern（正则，忽略大小写）时，把 hint 加入系统提示
#[derive(Debug, Clone, Deserialize)]
pub struct HintRule {
    pub pattern: String,
    pub hint: String,
}

/// [log] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// [web] 段：hive-web 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

fn default_web_host() -> String {
    "127.0.0.1".to_string()
}

fn default_web_port() -> u16 {
    8080
}

impl OrchestratorSection {
    /// 至少 1 轮
    pub fn effective_max_cycles(&self) -> usize {
        self.max_cycles.max(1)
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.max_cycles, 8);
        assert_eq!(cfg.agents.manifest_dir, PathBuf::from("config/agents"));
        assert_eq!(cfg.app.trace_log, PathBuf::from("logs/agent_logs.jsonl"));
        assert!(cfg.agents.eager_connect);
    }

    #[test]
    fn test_max_cycles_clamped() {
        let section = OrchestratorSection {
            max_cycles: 0,
            ..Default::default()
        };
        assert_eq!(section.effective_max_cycles(), 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[orchestrator]
max_cycles = 3

[[orchestrator.hints]]
pattern = "europe|asia"
hint = "The query names a region."

[agents]
eager_connect = false
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.max_cycles, 3);
        assert_eq!(cfg.orchestrator.hints.len(), 1);
        assert!(!cfg.agents.eager_connect);
        assert_eq!(cfg.agents.call_timeout_secs, 30);
    }
}
