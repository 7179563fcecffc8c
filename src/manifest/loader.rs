//! 描述清单加载器
//!
//! load(dir) 读取目录下所有 *.toml / *.json，解析为 AgentDescriptor；
//! 任一文件格式错误、名称为空或名称重复都返回 HiveError::Configuration。

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::HiveError;

/// Agent 的连接参数（对编排器不透明，只有会话层解释它）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionSpec {
    /// 启动子进程，按行收发 JSON-RPC
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// 值形如 `${VAR}` 时从当前环境展开
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// JSON-RPC over HTTP POST
    Http {
        url: String,
        /// 从该环境变量读取 Bearer token
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

/// 单个 Agent 的静态描述，加载后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub connection: ConnectionSpec,
    /// 声明的能力名；实时发现失败时作为兜底
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentDescriptor {
    /// 用于系统提示中的 Agent 列表
    pub fn summary(&self) -> String {
        if self.description.is_empty() {
            format!("- {}", self.name)
        } else {
            format!("- {}: {}", self.name, self.description)
        }
    }
}

/// 从目录加载全部描述文件，按文件名排序
pub fn load(dir: impl AsRef<Path>) -> Result<Vec<AgentDescriptor>, HiveError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(HiveError::Configuration(format!(
            "manifest directory not found: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for ext in ["toml", "json"] {
        let pattern = dir.join(format!("*.{ext}"));
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|e| HiveError::Configuration(format!("bad manifest pattern: {e}")))?;
        for entry in paths {
            let path = entry.map_err(|e| HiveError::Configuration(e.to_string()))?;
            if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(files.len());
    for path in files {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            HiveError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let descriptor = parse_descriptor(&path, &content)?;
        if !seen.insert(descriptor.name.clone()) {
            return Err(HiveError::Configuration(format!(
                "duplicate agent name '{}' in {}",
                descriptor.name,
                path.display()
            )));
        }
        descriptors.push(descriptor);
    }

    tracing::info!(dir = %dir.display(), count = descriptors.len(), "Loaded agent manifest");
    Ok(descriptors)
}

/// 按扩展名解析单个描述文件
pub fn parse_descriptor(path: &Path, content: &str) -> Result<AgentDescriptor, HiveError> {
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let descriptor: AgentDescriptor = if is_json {
        serde_json::from_str(content)
            .map_err(|e| HiveError::Configuration(format!("{}: {e}", path.display())))?
    } else {
        toml::from_str(content)
            .map_err(|e| HiveError::Configuration(format!("{}: {e}", path.display())))?
    };

    if descriptor.name.trim().is_empty() {
        return Err(HiveError::Configuration(format!(
            "{}: agent name must not be empty",
            path.display()
        )));
    }
    match &descriptor.connection {
        ConnectionSpec::Stdio { command, .. } if command.trim().is_empty() => {
            return Err(HiveError::Configuration(format!(
                "{}: stdio command must not be empty",
                path.display()
            )));
        }
        ConnectionSpec::Http { url, .. } if url.trim().is_empty() => {
            return Err(HiveError::Configuration(format!(
                "{}: http url must not be empty",
                path.display()
            )));
        }
        _ => {}
    }
    Ok(descriptor)
}
