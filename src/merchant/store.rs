//! 商户状态存储：商品、购物车、结账会话的唯一事实来源
//!
//! 所有状态在一把 RwLock 之后；confirm 的库存复核与扣减在同一个写锁内完成，
//! 任何并发修改都看不到“扣了一半”的中间状态。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::catalog::keyword_search;
use super::manifest::build_manifest;
use super::{
    Cart, CartItem, CartStatus, CheckoutLine, CheckoutSession, CheckoutStatus, Manifest, Product,
    ProductFilter, SearchRequest, StockShortfall,
};
use crate::core::AgentError;
use crate::protocol::CommerceApi;

#[derive(Default)]
struct MerchantState {
    /// 目录顺序
    products: Vec<Product>,
    index: HashMap<String, usize>,
    carts: HashMap<String, Cart>,
    checkouts: HashMap<String, CheckoutSession>,
}

impl MerchantState {
    fn product(&self, id: &str) -> Result<&Product, AgentError> {
        self.index
            .get(id)
            .map(|&i| &self.products[i])
            .ok_or_else(|| AgentError::ProductNotFound(id.to_string()))
    }

    fn product_mut(&mut self, id: &str) -> Result<&mut Product, AgentError> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.products[i]),
            None => Err(AgentError::ProductNotFound(id.to_string())),
        }
    }

    fn cart_mut(&mut self, id: &str) -> Result<&mut Cart, AgentError> {
        self.carts
            .get_mut(id)
            .ok_or_else(|| AgentError::CartNotFound(id.to_string()))
    }

    /// 请求数量超过在库数量时返回 InsufficientStock
    fn check_stock(&self, product_id: &str, requested: u32) -> Result<(), AgentError> {
        let product = self.product(product_id)?;
        if requested > product.quantity {
            return Err(AgentError::InsufficientStock {
                shortfalls: vec![StockShortfall {
                    product_id: product_id.to_string(),
                    requested,
                    available: product.quantity,
                }],
            });
        }
        Ok(())
    }
}

/// 内存商户存储；既是 HTTP 服务的后端，也可在进程内直接作为 CommerceApi 使用
pub struct MerchantStore {
    state: RwLock<MerchantState>,
    manifest: Manifest,
}

impl MerchantStore {
    pub fn new(products: Vec<Product>, protocol_version: &str) -> Self {
        let index = products
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        Self {
            state: RwLock::new(MerchantState {
                products,
                index,
                ..Default::default()
            }),
            manifest: build_manifest(protocol_version),
        }
    }

    /// 直接设置在库数量（补货或线下售出）
    pub async fn set_quantity(&self, product_id: &str, quantity: u32) -> Result<(), AgentError> {
        let mut state = self.state.write().await;
        state.product_mut(product_id)?.quantity = quantity;
        tracing::info!(product_id, quantity, "stock level set");
        Ok(())
    }
}

#[async_trait]
impl CommerceApi for MerchantStore {
    async fn discover(&self) -> Result<Manifest, AgentError> {
        Ok(self.manifest.clone())
    }

    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, AgentError> {
        let state = self.state.read().await;
        Ok(state
            .products
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect())
    }

    async fn get_product(&self, product_id: &str) -> Result<Product, AgentError> {
        self.state.read().await.product(product_id).cloned()
    }

    async fn search_products(&self, request: &SearchRequest) -> Result<Vec<Product>, AgentError> {
        let state = self.state.read().await;
        let visible = state
            .products
            .iter()
            .filter(|p| !request.in_stock_only || p.in_stock());
        Ok(keyword_search(visible, &request.query, request.limit))
    }

    async fn create_cart(&self) -> Result<Cart, AgentError> {
        let cart = Cart {
            id: format!("cart-{}", uuid::Uuid::new_v4()),
            items: Vec::new(),
            status: CartStatus::Open,
        };
        self.state
            .write()
            .await
            .carts
            .insert(cart.id.clone(), cart.clone());
        tracing::debug!(cart_id = %cart.id, "cart created");
        Ok(cart)
    }

    async fn get_cart(&self, cart_id: &str) -> Result<Cart, AgentError> {
        self.state
            .read()
            .await
            .carts
            .get(cart_id)
            .cloned()
            .ok_or_else(|| AgentError::CartNotFound(cart_id.to_string()))
    }

    async fn add_item(
        &self,
        cart_id: &str,
        product_id: &str,
        quantity: u32,
    ) -> Result<Cart, AgentError> {
        if quantity == 0 {
            return Err(AgentError::InvalidRequest(
                "quantity must be greater than zero".to_string(),
            ));
        }
        let mut state = self.state.write().await;
        let existing = state.cart_mut(cart_id)?.quantity_of(product_id);
        let merged = existing.saturating_add(quantity);
        state.check_stock(product_id, merged)?;

        let cart = state.cart_mut(cart_id)?;
        match cart.items.iter_mut().find(|i| i.product_id == product_id) {
            Some(item) => item.quantity = merged,
            None => cart.items.push(CartItem {
                product_id: product_id.to_string(),
                quantity,
            }),
        }
        tracing::debug!(cart_id, product_id, quantity = merged, "cart item added");
        Ok(cart.clone())
    }

    async fn update_item(
        &self,
        cart_id: &str,
        product_id: &str,
        quantity: u32,
    ) -> Result<Cart, AgentError> {
        let mut state = self.state.write().await;
        state.cart_mut(cart_id)?;
        if quantity == 0 {
            let cart = state.cart_mut(cart_id)?;
            cart.items.retain(|i| i.product_id != product_id);
            return Ok(cart.clone());
        }
        state.check_stock(product_id, quantity)?;

        let cart = state.cart_mut(cart_id)?;
        match cart.items.iter_mut().find(|i| i.product_id == product_id) {
            Some(item) => item.quantity = quantity,
            None => cart.items.push(CartItem {
                product_id: product_id.to_string(),
                quantity,
            }),
        }
        Ok(cart.clone())
    }

    async fn remove_item(&self, cart_id: &str, product_id: &str) -> Result<Cart, AgentError> {
        let mut state = self.state.write().await;
        let cart = state.cart_mut(cart_id)?;
        cart.items.retain(|i| i.product_id != product_id);
        Ok(cart.clone())
    }

    async fn create_checkout(&self, cart_id: &str) -> Result<CheckoutSession, AgentError> {
        let mut state = self.state.write().await;
        let cart = state
            .carts
            .get(cart_id)
            .cloned()
            .ok_or_else(|| AgentError::CartNotFound(cart_id.to_string()))?;
        if cart.is_empty() {
            return Err(AgentError::EmptyCart(cart_id.to_string()));
        }

        let mut lines = Vec::with_capacity(cart.items.len());
        for item in &cart.items {
            let product = state.product(&item.product_id)?;
            lines.push(CheckoutLine {
                product_id: product.id.clone(),
                name: product.name.clone(),
                quantity: item.quantity,
                unit_price_cents: product.price_cents,
            });
        }
        let total_cents = lines
            .iter()
            .map(|l| l.unit_price_cents * u64::from(l.quantity))
            .sum();

        let session = CheckoutSession {
            id: format!("chk-{}", uuid::Uuid::new_v4()),
            cart_id: cart_id.to_string(),
            status: CheckoutStatus::Pending,
            lines,
            total_cents,
            created_at: chrono::Utc::now(),
            shortfalls: Vec::new(),
        };
        state.checkouts.insert(session.id.clone(), session.clone());
        tracing::info!(checkout_id = %session.id, cart_id, total_cents, "checkout created");
        Ok(session)
    }

    async fn get_checkout(&self, checkout_id: &str) -> Result<CheckoutSession, AgentError> {
        self.state
            .read()
            .await
            .checkouts
            .get(checkout_id)
            .cloned()
            .ok_or_else(|| AgentError::CheckoutNotFound(checkout_id.to_string()))
    }

    async fn confirm_checkout(&self, checkout_id: &str) -> Result<CheckoutSession, AgentError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let session = state
            .checkouts
            .get_mut(checkout_id)
            .ok_or_else(|| AgentError::CheckoutNotFound(checkout_id.to_string()))?;
        if session.status != CheckoutStatus::Pending {
            return Err(AgentError::InvalidCheckoutState {
                checkout_id: checkout_id.to_string(),
                status: session.status,
            });
        }

        let mut shortfalls = Vec::new();
        for line in &session.lines {
            let available = state
                .index
                .get(&line.product_id)
                .map(|&i| state.products[i].quantity)
                .unwrap_or(0);
            if line.quantity > available {
                shortfalls.push(StockShortfall {
                    product_id: line.product_id.clone(),
                    requested: line.quantity,
                    available,
                });
            }
        }

        if !shortfalls.is_empty() {
            tracing::warn!(checkout_id, ?shortfalls, "checkout failed on stock re-validation");
            session.status = CheckoutStatus::Failed;
            session.shortfalls = shortfalls;
            return Ok(session.clone());
        }

        for line in &session.lines {
            if let Some(&i) = state.index.get(&line.product_id) {
                state.products[i].quantity -= line.quantity;
            }
        }
        session.status = CheckoutStatus::Confirmed;
        tracing::info!(checkout_id, total_cents = session.total_cents, "checkout confirmed");
        Ok(session.clone())
    }
}
