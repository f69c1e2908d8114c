//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SHOPBEE__*` 覆盖（双下划线表示嵌套，如 `SHOPBEE__MERCHANT__PORT=8081`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{Backoff, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub merchant: MerchantSection,
    pub client: ClientSection,
    pub retrieval: RetrievalSection,
    pub session: SessionSection,
    pub supervisor: SupervisorSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// REPL 使用的会话 id（单用户终端）
    #[serde(default = "default_conversation_id")]
    pub conversation_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            conversation_id: default_conversation_id(),
        }
    }
}

fn default_conversation_id() -> String {
    "local".to_string()
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；是否真正启用取决于 API Key
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 商品向量检索使用的嵌入模型
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// 嵌入服务地址，未设置时沿用 base_url
    pub embedding_base_url: Option<String>,
    /// 单次 LLM 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            embedding_model: default_embedding_model(),
            embedding_base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// [merchant] 段：商户服务进程与监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct MerchantSection {
    /// 商户服务可执行文件；未设置时使用与主程序同目录的 shopbee-merchant
    pub program: Option<PathBuf>,
    /// 商品目录（.json / .toml）；未设置时使用内置示例目录
    pub catalog_path: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

impl Default for MerchantSection {
    fn default() -> Self {
        Self {
            program: None,
            catalog_path: None,
            host: default_host(),
            port: default_port(),
            protocol_version: default_protocol_version(),
        }
    }
}

impl MerchantSection {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8089
}

fn default_protocol_version() -> String {
    crate::merchant::PROTOCOL_VERSION.to_string()
}

/// [client] 段：协议客户端超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_client_timeout(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff: Backoff::default(),
        }
    }
}

impl ClientSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_ms),
            backoff: self.backoff,
        }
    }
}

fn default_client_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    1000
}

/// [retrieval] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// 低于该余弦相似度的候选被丢弃
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default)]
    pub in_stock_only: bool,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            in_stock_only: false,
        }
    }
}

fn default_top_k() -> usize {
    3
}

fn default_similarity_threshold() -> f32 {
    0.7
}

/// [session] 段
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 会话内保留的对话轮数
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_sessions: default_max_sessions(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_history_turns: default_max_history_turns(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_sessions() -> usize {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_history_turns() -> usize {
    10
}

/// [supervisor] 段：子进程启动与停止（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// 单次健康探测超时
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            grace_period_ms: default_grace_period_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

/// 从 config 目录加载配置，环境变量 SHOPBEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SHOPBEE__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("SHOPBEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.client.timeout_secs, 10);
        assert_eq!(cfg.client.max_retries, 2);
        assert_eq!(cfg.retrieval.similarity_threshold, 0.7);
        assert_eq!(cfg.session.ttl_secs, 3600);
        assert_eq!(cfg.supervisor.startup_timeout_ms, 10_000);
        assert_eq!(cfg.supervisor.grace_period_ms, 5_000);
        assert_eq!(cfg.merchant.base_url(), "http://127.0.0.1:8089");
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[merchant]\nport = 9100\n\n[client]\nbackoff = \"exponential\"\nmax_retries = 4\n\n[retrieval]\nin_stock_only = true"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.merchant.port, 9100);
        assert_eq!(cfg.merchant.host, "127.0.0.1");
        assert!(cfg.retrieval.in_stock_only);
        let policy = cfg.client.retry_policy();
        assert_eq!(policy.backoff, Backoff::Exponential);
        assert_eq!(policy.max_retries, 4);
    }
}
