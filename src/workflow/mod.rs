//! 购物工作流：意图识别 -> 检索 -> 消歧 -> 购物车（查看 / 修改） / 结账 -> 回复

pub mod engine;
pub mod graph;
pub mod intent;
pub mod select;
pub mod state;

pub use engine::WorkflowEngine;
pub use graph::Node;
pub use intent::{extract_cart_edit, extract_quantity, fast_match, IntentRecognizer};
pub use select::{select_product, Selection};
pub use state::{AgentState, CartEdit, CartLine, Intent};
