//! 商户协议数据类型
//!
//! Product / Cart / CheckoutSession / Manifest 及各端点的请求体，HTTP 两端共用。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type ProductId = String;
pub type CartId = String;
pub type CheckoutId = String;

/// 商品；quantity 即在库数量（无符号，天然 ≥ 0）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 价格（分）
    pub price_cents: u64,
    pub quantity: u32,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Product {
    pub fn in_stock(&self) -> bool {
        self.quantity > 0
    }

    pub fn category(&self) -> Option<&str> {
        self.attributes.get("category").map(String::as_str)
    }

    /// 展示用价格，如 `$12.99`
    pub fn display_price(&self) -> String {
        format_cents(self.price_cents)
    }
}

pub fn format_cents(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    Open,
}

/// 购物车：同一 product_id 至多一行，数量恒 > 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    pub items: Vec<CartItem>,
    pub status: CartStatus,
}

impl Cart {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn quantity_of(&self, product_id: &str) -> u32 {
        self.items
            .iter()
            .find(|i| i.product_id == product_id)
            .map(|i| i.quantity)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Pending,
    Confirmed,
    Failed,
}

impl CheckoutStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CheckoutStatus::Pending)
    }
}

impl fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckoutStatus::Pending => "pending",
            CheckoutStatus::Confirmed => "confirmed",
            CheckoutStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// confirm 时库存不足的行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortfall {
    pub product_id: ProductId,
    pub requested: u32,
    pub available: u32,
}

/// 结账行：创建时从购物车快照，带单价
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutLine {
    pub product_id: ProductId,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: CheckoutId,
    pub cart_id: CartId,
    pub status: CheckoutStatus,
    pub lines: Vec<CheckoutLine>,
    pub total_cents: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shortfalls: Vec<StockShortfall>,
}

/// 协议能力声明：名称、方法、路径模式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub methods: Vec<String>,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub protocol_version: String,
    pub capabilities: Vec<Capability>,
}

impl Manifest {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}

/// GET /products 查询参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub in_stock_only: bool,
}

impl ProductFilter {
    pub fn matches(&self, product: &Product) -> bool {
        if self.in_stock_only && !product.in_stock() {
            return false;
        }
        match &self.category {
            Some(c) => product
                .category()
                .map(|pc| pc.eq_ignore_ascii_case(c))
                .unwrap_or(false),
            None => true,
        }
    }
}

/// POST /products/search 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default)]
    pub in_stock_only: bool,
}

fn default_search_limit() -> usize {
    10
}

/// POST /cart/{id}/items 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddItemRequest {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// PATCH /cart/{id}/items/{product_id} 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: u32,
}

/// POST /checkout-sessions 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCheckoutRequest {
    pub cart_id: CartId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(1299), "$12.99");
        assert_eq!(format_cents(5), "$0.05");
    }

    #[test]
    fn test_filter_category_case_insensitive() {
        let mut attributes = BTreeMap::new();
        attributes.insert("category".to_string(), "Audio".to_string());
        let p = Product {
            id: "p".into(),
            name: "Headphones".into(),
            description: String::new(),
            price_cents: 100,
            quantity: 0,
            attributes,
        };
        let filter = ProductFilter {
            category: Some("audio".into()),
            in_stock_only: false,
        };
        assert!(filter.matches(&p));
        let filter = ProductFilter {
            category: Some("audio".into()),
            in_stock_only: true,
        };
        assert!(!filter.matches(&p));
    }

    #[test]
    fn test_checkout_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&CheckoutStatus::Confirmed).unwrap(),
            "\"confirmed\""
        );
        assert!(CheckoutStatus::Failed.is_terminal());
        assert!(!CheckoutStatus::Pending.is_terminal());
    }
}
