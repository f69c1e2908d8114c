//! shopbee - Rust 购物智能体
//!
//! 模块划分：
//! - **agent**: 对话运行时（会话串行化 + 工作流执行）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、错误恢复、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、嵌入
//! - **memory**: 对话历史与中英文分词
//! - **merchant**: 商户协议服务（目录、购物车、结账）
//! - **observability**: 日志初始化
//! - **protocol**: 商户协议客户端（超时、重试、错误映射）
//! - **retrieval**: 语义检索与关键词兜底
//! - **session**: 会话管理（TTL、LRU 淘汰、轮次闸门）
//! - **supervisor**: 商户子进程监管
//! - **workflow**: 意图识别、商品消歧与工作流引擎

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod merchant;
pub mod observability;
pub mod protocol;
pub mod retrieval;
pub mod session;
pub mod supervisor;
pub mod workflow;

pub use agent::{Agent, TurnReply};
pub use config::{load_config, AppConfig};
pub use core::AgentError;
