//! 单轮工作流状态
//!
//! AgentState 每轮从 Session 播种，节点逐个读写，轮次结束后把需要持久的部分写回 Session。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::Message;
use crate::merchant::{Cart, CartId, CheckoutId, CheckoutSession, Product, ProductId};
use crate::session::Session;

/// 用户意图（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Search,
    Buy,
    Cart,
    Checkout,
    #[default]
    General,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::Search,
        Intent::Buy,
        Intent::Cart,
        Intent::Checkout,
        Intent::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Search => "search",
            Intent::Buy => "buy",
            Intent::Cart => "cart",
            Intent::Checkout => "checkout",
            Intent::General => "general",
        }
    }

    /// 解析分类标签（大小写、首尾标点不敏感）；未知标签返回 None
    pub fn from_label(label: &str) -> Option<Intent> {
        let label = label
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        Intent::ALL.into_iter().find(|i| i.as_str() == label)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 对购物车已有商品的修改
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartEdit {
    Remove,
    SetQuantity(u32),
}

/// 购物车展示行（商品名与单价取自商户）
#[derive(Debug, Clone, PartialEq)]
pub struct CartLine {
    pub product_id: ProductId,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AgentState {
    pub session_id: String,
    pub user_text: String,
    pub intent: Intent,
    /// 请求数量（buy），默认 1
    pub quantity: u32,
    /// Cart 意图下的修改操作；None 表示只查看
    pub cart_edit: Option<CartEdit>,
    /// 修改生效后的说明，放在购物车清单之前
    pub cart_notice: Option<String>,
    /// 检索得到的候选（按排名）
    pub candidates: Vec<Product>,
    pub retrieval_degraded: bool,
    pub selected_product_id: Option<ProductId>,
    /// 无法在多个候选（或购物车行）间确定时置位，回复改为追问
    pub needs_clarification: bool,
    pub cart_id: Option<CartId>,
    pub checkout_id: Option<CheckoutId>,
    pub cart: Option<Cart>,
    pub cart_lines: Vec<CartLine>,
    pub checkout: Option<CheckoutSession>,
    /// 上一轮展示的商品 id
    pub last_candidates: Vec<ProductId>,
    pub history: Vec<Message>,
    pub error: Option<AgentError>,
    pub reply: String,
}

impl AgentState {
    pub fn from_session(session: &Session, user_text: &str) -> Self {
        Self {
            session_id: session.id.clone(),
            user_text: user_text.trim().to_string(),
            quantity: 1,
            cart_id: session.cart_id.clone(),
            checkout_id: session.checkout_id.clone(),
            last_candidates: session.last_candidates.clone(),
            history: session.history.messages().to_vec(),
            ..Default::default()
        }
    }

    /// 写回会话：购物车 / 结账引用、本轮展示的候选、对话历史
    pub fn write_back(&self, session: &mut Session) {
        session.cart_id = self.cart_id.clone();
        session.checkout_id = self.checkout_id.clone();
        session.last_candidates = self.last_candidates.clone();
        if !self.user_text.is_empty() {
            session.history.push(Message::user(self.user_text.clone()));
        }
        session.history.push(Message::assistant(self.reply.clone()));
    }

    pub fn selected_product(&self) -> Option<&Product> {
        let id = self.selected_product_id.as_deref()?;
        self.candidates.iter().find(|p| p.id == id)
    }

    pub fn fail(&mut self, error: AgentError) {
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_from_label() {
        assert_eq!(Intent::from_label("Buy"), Some(Intent::Buy));
        assert_eq!(Intent::from_label(" checkout.\n"), Some(Intent::Checkout));
        assert_eq!(Intent::from_label("\"search\""), Some(Intent::Search));
        assert_eq!(Intent::from_label("purchase"), None);
    }
}
