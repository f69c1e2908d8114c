//! 工作流节点图（固定拓扑）
//!
//! 入口 DetectIntent，终点 GenerateResponse；任何可能出错的节点在 state.error 被设置后
//! 转向 HandleError，HandleError 之后仍经 GenerateResponse 输出，保证回复形态一致。

use std::fmt;

use super::state::{AgentState, Intent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    DetectIntent,
    Retrieve,
    SelectProduct,
    Buy,
    Cart,
    Checkout,
    GenerateResponse,
    HandleError,
}

impl Node {
    pub const ENTRY: Node = Node::DetectIntent;

    /// 节点执行后可能写入 state.error
    pub fn is_fallible(self) -> bool {
        matches!(
            self,
            Node::Retrieve | Node::SelectProduct | Node::Buy | Node::Cart | Node::Checkout
        )
    }

    /// 根据执行后的状态选择后继节点；None 表示本轮结束
    pub fn next(self, state: &AgentState) -> Option<Node> {
        if self.is_fallible() && state.error.is_some() {
            return Some(Node::HandleError);
        }
        match self {
            Node::DetectIntent => Some(match state.intent {
                Intent::Search | Intent::Buy => Node::Retrieve,
                Intent::Cart => Node::Cart,
                Intent::Checkout => Node::Checkout,
                Intent::General => Node::GenerateResponse,
            }),
            Node::Retrieve => Some(match state.intent {
                Intent::Buy => Node::SelectProduct,
                _ => Node::GenerateResponse,
            }),
            Node::SelectProduct => Some(if state.selected_product_id.is_some() {
                Node::Buy
            } else {
                // 候选无法区分，追问
                Node::GenerateResponse
            }),
            Node::Buy | Node::Cart | Node::Checkout | Node::HandleError => {
                Some(Node::GenerateResponse)
            }
            Node::GenerateResponse => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
