//! 商品检索：语义主路径 + 确定性关键词兜底
//!
//! 主路径查询向量索引，丢弃低于阈值的候选；主路径任何失败（未配置索引、嵌入服务不可达、索引为空）
//! 都被吞掉并改走关键词匹配，结果带 degraded 标记，由工作流在回复中注明。
//! 兜底基于启动时从商户拉取的目录快照，快照只用于匹配；`search_live` 在展示前逐个向商户
//! 重读候选，库存与价格（以及 in_stock_only 过滤）都以商户当前状态为准。

pub mod index;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::RetrievalSection;
use crate::core::AgentError;
use crate::merchant::{keyword_search, Product, ProductFilter};
use crate::protocol::CommerceApi;

pub use index::{cosine_similarity, EmbeddingIndex};

/// 带相似度分数的候选
#[derive(Debug, Clone)]
pub struct ScoredProduct {
    pub product: Product,
    pub score: f32,
}

/// 语义索引抽象
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 返回按相似度降序排列的至多 k 个候选
    async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredProduct>, String>;
}

/// 一次检索的结果
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub products: Vec<Product>,
    /// 结果来自关键词兜底
    pub degraded: bool,
    /// 降级原因（仅日志用）
    pub reason: Option<String>,
}

pub struct Retriever {
    index: Option<Arc<dyn VectorIndex>>,
    catalog: RwLock<Vec<Product>>,
    threshold: f32,
    in_stock_only: bool,
}

impl Retriever {
    pub fn new(index: Option<Arc<dyn VectorIndex>>, catalog: Vec<Product>) -> Self {
        Self {
            index,
            catalog: RwLock::new(catalog),
            threshold: 0.7,
            in_stock_only: false,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_in_stock_only(mut self, in_stock_only: bool) -> Self {
        self.in_stock_only = in_stock_only;
        self
    }

    pub fn with_config(self, cfg: &RetrievalSection) -> Self {
        self.with_threshold(cfg.similarity_threshold)
            .with_in_stock_only(cfg.in_stock_only)
    }

    /// 从商户重新拉取目录快照
    pub async fn refresh_catalog(&self, api: &dyn CommerceApi) -> Result<usize, AgentError> {
        let products = api.list_products(&ProductFilter::default()).await?;
        let count = products.len();
        *self.catalog.write().await = products;
        tracing::debug!(products = count, "retrieval catalog snapshot refreshed");
        Ok(count)
    }

    pub async fn catalog(&self) -> Vec<Product> {
        self.catalog.read().await.clone()
    }

    /// 检索；永不返回错误
    pub async fn search(&self, query: &str, k: usize) -> SearchOutcome {
        match self.semantic(query, k).await {
            Ok(products) => SearchOutcome {
                products,
                degraded: false,
                reason: None,
            },
            Err(reason) => {
                let degraded = AgentError::RetrievalDegraded(reason.clone());
                tracing::warn!(query, "{}", degraded);
                let catalog = self.catalog.read().await;
                let products = keyword_search(catalog.iter(), query, k);
                SearchOutcome {
                    products,
                    degraded: true,
                    reason: Some(reason),
                }
            }
        }
    }

    /// 检索并向商户重读候选；已下架的候选跳过，上游错误照常返回
    pub async fn search_live(
        &self,
        api: &dyn CommerceApi,
        query: &str,
        k: usize,
    ) -> Result<SearchOutcome, AgentError> {
        // 缺货候选在重读后才被过滤，多取一些免得占满名额
        let fetch = if self.in_stock_only { k.saturating_mul(3) } else { k };
        let mut outcome = self.search(query, fetch).await;
        let mut live = Vec::with_capacity(k);
        for candidate in &outcome.products {
            if live.len() >= k {
                break;
            }
            match api.get_product(&candidate.id).await {
                Ok(product) if !self.in_stock_only || product.in_stock() => live.push(product),
                Ok(_) => {}
                Err(AgentError::ProductNotFound(_)) => {
                    tracing::debug!(product_id = %candidate.id, "candidate no longer listed");
                }
                Err(e) => return Err(e),
            }
        }
        outcome.products = live;
        Ok(outcome)
    }

    async fn semantic(&self, query: &str, k: usize) -> Result<Vec<Product>, String> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| "no vector index configured".to_string())?;
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let scored = index.query(query, k).await?;
        Ok(scored
            .into_iter()
            .filter(|s| s.score >= self.threshold)
            .map(|s| s.product)
            .take(k)
            .collect())
    }
}
