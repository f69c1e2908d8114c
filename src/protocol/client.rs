//! 商户协议 HTTP 客户端
//!
//! 每次调用带独立超时；重试只用于两类情况：
//! - 幂等读取（GET）：连接失败、超时、5xx 均可重试
//! - 连接级失败（请求确定未送达）：任何方法都可重试
//! confirm_checkout 一旦请求可能已送达就绝不重试，返回 ConfirmOutcomeUnknown，
//! 由调用方读取结账会话确认真实结果，避免重复扣减库存。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{CommerceApi, RetryPolicy};
use crate::core::{AgentError, ErrorBody};
use crate::merchant::{
    AddItemRequest, Cart, CheckoutSession, CreateCheckoutRequest, Manifest, Product,
    ProductFilter, SearchRequest, UpdateItemRequest,
};

/// 调用的重试语义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    /// 幂等读取
    Read,
    /// 非幂等修改：仅连接级失败可重试
    Mutation,
    /// 结账确认：送达后结果不明时交给调用方核实
    Confirm,
}

/// 单次尝试的失败分类
enum Attempt {
    Retry(String),
    Fail(AgentError),
}

#[derive(Clone)]
pub struct ProtocolClient {
    http: reqwest::Client,
    base_url: Url,
    policy: RetryPolicy,
}

impl ProtocolClient {
    pub fn new(base_url: &str, policy: RetryPolicy) -> Result<Self, AgentError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AgentError::ConfigError(format!("invalid merchant url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AgentError::ConfigError(format!(
                "merchant url cannot be a base: {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::ConfigError(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            policy,
        })
    }

    /// 同一服务地址、不同重试策略的客户端（共享连接池）
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            policy,
        }
    }

    /// 单次、短超时的 discover，用于进程健康探测
    pub async fn probe(&self, timeout: Duration) -> Result<Manifest, AgentError> {
        self.with_policy(RetryPolicy::single_shot(timeout))
            .discover()
            .await
    }

    fn url(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url, AgentError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AgentError::ConfigError(format!("bad base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
        kind: CallKind,
    ) -> Result<T, AgentError> {
        let attempts = self.policy.max_retries + 1;
        let mut last_failure = String::new();

        for attempt in 0..attempts {
            match self.attempt(method.clone(), url.clone(), body.as_ref(), kind).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Fail(err)) => return Err(err),
                Err(Attempt::Retry(reason)) => {
                    tracing::warn!(
                        %method,
                        url = %url,
                        attempt = attempt + 1,
                        attempts,
                        "merchant call failed: {}",
                        reason
                    );
                    last_failure = reason;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.policy.delay(attempt)).await;
                    }
                }
            }
        }

        Err(AgentError::UpstreamUnavailable(format!(
            "{method} {} failed after {attempts} attempt(s): {last_failure}",
            url.path()
        )))
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        kind: CallKind,
    ) -> Result<T, Attempt> {
        let mut request = self
            .http
            .request(method, url.clone())
            .timeout(self.policy.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            // 连接未建立，请求一定没有送达
            Err(e) if e.is_connect() => return Err(Attempt::Retry(e.to_string())),
            Err(e) => return Err(self.ambiguous(kind, &url, e.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| self.ambiguous(kind, &url, format!("bad response body: {e}")));
        }

        let text = response.text().await.unwrap_or_default();
        if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
            return Err(Attempt::Fail(AgentError::from_body(body)));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(self.ambiguous(kind, &url, format!("status {status}")));
        }
        Err(Attempt::Fail(AgentError::InvalidRequest(format!(
            "unexpected status {status}: {text}"
        ))))
    }

    /// 请求可能已被处理的失败：读可重试，修改直接失败，confirm 标记结果不明
    fn ambiguous(&self, kind: CallKind, url: &Url, reason: String) -> Attempt {
        match kind {
            CallKind::Read => Attempt::Retry(reason),
            CallKind::Mutation => Attempt::Fail(AgentError::UpstreamUnavailable(format!(
                "{}: {reason}",
                url.path()
            ))),
            CallKind::Confirm => {
                let checkout_id = url
                    .path_segments()
                    .and_then(|s| s.rev().nth(1))
                    .unwrap_or_default()
                    .to_string();
                tracing::warn!(%checkout_id, "confirm outcome unknown: {}", reason);
                Attempt::Fail(AgentError::ConfirmOutcomeUnknown(checkout_id))
            }
        }
    }
}

#[async_trait]
impl CommerceApi for ProtocolClient {
    async fn discover(&self) -> Result<Manifest, AgentError> {
        let url = self.url(&["discovery"], &[])?;
        self.call(Method::GET, url, None, CallKind::Read).await
    }

    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, AgentError> {
        let mut query = Vec::new();
        if let Some(category) = &filter.category {
            query.push(("category", category.clone()));
        }
        if filter.in_stock_only {
            query.push(("in_stock_only", "true".to_string()));
        }
        let url = self.url(&["products"], &query)?;
        self.call(Method::GET, url, None, CallKind::Read).await
    }

    async fn get_product(&self, product_id: &str) -> Result<Product, AgentError> {
        let url = self.url(&["products", product_id], &[])?;
        self.call(Method::GET, url, None, CallKind::Read).await
    }

    async fn search_products(&self, request: &SearchRequest) -> Result<Vec<Product>, AgentError> {
        let url = self.url(&["products", "search"], &[])?;
        // 只读查询，虽然是 POST 也按幂等处理
        self.call(Method::POST, url, Some(json!(request)), CallKind::Read)
            .await
    }

    async fn create_cart(&self) -> Result<Cart, AgentError> {
        let url = self.url(&["cart"], &[])?;
        self.call(Method::POST, url, None, CallKind::Mutation).await
    }

    async fn get_cart(&self, cart_id: &str) -> Result<Cart, AgentError> {
        let url = self.url(&["cart", cart_id], &[])?;
        self.call(Method::GET, url, None, CallKind::Read).await
    }

    async fn add_item(
        &self,
        cart_id: &str,
        product_id: &str,
        quantity: u32,
    ) -> Result<Cart, AgentError> {
        let url = self.url(&["cart", cart_id, "items"], &[])?;
        let body = json!(AddItemRequest {
            product_id: product_id.to_string(),
            quantity,
        });
        self.call(Method::POST, url, Some(body), CallKind::Mutation)
            .await
    }

    async fn update_item(
        &self,
        cart_id: &str,
        product_id: &str,
        quantity: u32,
    ) -> Result<Cart, AgentError> {
        let url = self.url(&["cart", cart_id, "items", product_id], &[])?;
        let body = json!(UpdateItemRequest { quantity });
        self.call(Method::PATCH, url, Some(body), CallKind::Mutation)
            .await
    }

    async fn remove_item(&self, cart_id: &str, product_id: &str) -> Result<Cart, AgentError> {
        let url = self.url(&["cart", cart_id, "items", product_id], &[])?;
        self.call(Method::DELETE, url, None, CallKind::Mutation)
            .await
    }

    async fn create_checkout(&self, cart_id: &str) -> Result<CheckoutSession, AgentError> {
        let url = self.url(&["checkout-sessions"], &[])?;
        let body = json!(CreateCheckoutRequest {
            cart_id: cart_id.to_string(),
        });
        self.call(Method::POST, url, Some(body), CallKind::Mutation)
            .await
    }

    async fn get_checkout(&self, checkout_id: &str) -> Result<CheckoutSession, AgentError> {
        let url = self.url(&["checkout-sessions", checkout_id], &[])?;
        self.call(Method::GET, url, None, CallKind::Read).await
    }

    async fn confirm_checkout(&self, checkout_id: &str) -> Result<CheckoutSession, AgentError> {
        let url = self.url(&["checkout-sessions", checkout_id, "confirm"], &[])?;
        self.call(Method::POST, url, None, CallKind::Confirm).await
    }
}
