//! 记忆层：会话内的短期对话历史与分词工具

pub mod conversation;
pub mod tokenizer;

pub use conversation::{ConversationMemory, Message, Role};
