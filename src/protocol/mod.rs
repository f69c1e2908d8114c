//! 商户协议客户端层：CommerceApi 抽象、HTTP 实现（超时 / 有界重试 / 退避）
//!
//! CommerceApi 同时由 ProtocolClient（跨进程 HTTP）与 MerchantStore（进程内）实现，
//! 编排层只依赖该 trait。

pub mod client;
pub mod retry;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::merchant::{
    missing_capabilities, Cart, CheckoutSession, Manifest, Product, ProductFilter, SearchRequest,
};

pub use client::ProtocolClient;
pub use retry::{Backoff, RetryPolicy};

/// 商户协议操作集合
#[async_trait]
pub trait CommerceApi: Send + Sync {
    async fn discover(&self) -> Result<Manifest, AgentError>;

    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, AgentError>;

    async fn get_product(&self, product_id: &str) -> Result<Product, AgentError>;

    async fn search_products(&self, request: &SearchRequest) -> Result<Vec<Product>, AgentError>;

    async fn create_cart(&self) -> Result<Cart, AgentError>;

    async fn get_cart(&self, cart_id: &str) -> Result<Cart, AgentError>;

    async fn add_item(
        &self,
        cart_id: &str,
        product_id: &str,
        quantity: u32,
    ) -> Result<Cart, AgentError>;

    /// quantity 为 0 时移除该行
    async fn update_item(
        &self,
        cart_id: &str,
        product_id: &str,
        quantity: u32,
    ) -> Result<Cart, AgentError>;

    async fn remove_item(&self, cart_id: &str, product_id: &str) -> Result<Cart, AgentError>;

    async fn create_checkout(&self, cart_id: &str) -> Result<CheckoutSession, AgentError>;

    async fn get_checkout(&self, checkout_id: &str) -> Result<CheckoutSession, AgentError>;

    /// 库存复核 + 原子扣减；库存不足时返回 status=failed 的会话（不是 Err）
    async fn confirm_checkout(&self, checkout_id: &str) -> Result<CheckoutSession, AgentError>;
}

/// 拉取 manifest 并确认其声明了 required 中的全部能力
pub async fn verify_manifest(
    api: &dyn CommerceApi,
    required: &[&str],
) -> Result<Manifest, AgentError> {
    let manifest = api.discover().await?;
    let missing = missing_capabilities(&manifest, required);
    if !missing.is_empty() {
        tracing::error!(?missing, "merchant manifest lacks required capabilities");
        return Err(AgentError::ManifestMismatch { missing });
    }
    tracing::info!(
        protocol_version = %manifest.protocol_version,
        capabilities = manifest.capabilities.len(),
        "merchant manifest verified"
    );
    Ok(manifest)
}
