//! 商品向量索引：索引时为每个商品生成嵌入，查询时按余弦相似度排序

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ScoredProduct, VectorIndex};
use crate::llm::EmbeddingProvider;
use crate::merchant::Product;

/// 内存向量索引
pub struct EmbeddingIndex {
    /// (product, embedding)，按目录顺序
    entries: RwLock<Vec<(Product, Vec<f32>)>>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            embedder,
        }
    }

    /// 为整个目录建立向量；单个商品嵌入失败时跳过，全部失败返回错误
    pub async fn index_catalog(&self, products: &[Product]) -> Result<usize, String> {
        let mut entries = Vec::with_capacity(products.len());
        let mut last_error = None;
        for product in products {
            let text = format!("{}. {}", product.name, product.description);
            match self.embedder.embed(&text).await {
                Ok(v) if !v.is_empty() => entries.push((product.clone(), v)),
                Ok(_) => last_error = Some(format!("empty embedding for {}", product.id)),
                Err(e) => {
                    tracing::warn!(product_id = %product.id, "embedding failed: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if entries.is_empty() && !products.is_empty() {
            return Err(last_error.unwrap_or_else(|| "no products indexed".to_string()));
        }
        let count = entries.len();
        *self.entries.write().await = entries;
        tracing::info!(indexed = count, total = products.len(), "product embedding index built");
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl VectorIndex for EmbeddingIndex {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredProduct>, String> {
        let query_embedding = self.embedder.embed(text).await?;
        if query_embedding.is_empty() {
            return Err("empty query embedding".to_string());
        }

        let entries = self.entries.read().await;
        if entries.is_empty() {
            return Err("index is empty".to_string());
        }
        let mut scored: Vec<ScoredProduct> = entries
            .iter()
            .map(|(product, emb)| ScoredProduct {
                product: product.clone(),
                score: cosine_similarity(&query_embedding, emb),
            })
            .collect();

        // 稳定排序：同分保持目录顺序
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// 余弦相似度
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
