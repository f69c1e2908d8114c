//! 商品目录加载：JSON / TOML 文件或内置示例目录
//!
//! 目录只在启动时加载一次；商品 id 必须唯一。

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use super::Product;
use crate::memory::tokenizer;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON catalog: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid TOML catalog: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Unsupported catalog format: {0} (expected .json or .toml)")]
    UnsupportedFormat(String),
    #[error("Duplicate product id in catalog: {0}")]
    DuplicateId(String),
}

/// `{ "products": [...] }` 或 TOML 的 `[[products]]`
#[derive(Deserialize)]
struct CatalogFile {
    products: Vec<Product>,
}

/// JSON 同时接受裸数组
#[derive(Deserialize)]
#[serde(untagged)]
enum JsonCatalog {
    Wrapped(CatalogFile),
    Bare(Vec<Product>),
}

/// 按扩展名解析目录文件
pub fn load_catalog(path: &Path) -> Result<Vec<Product>, CatalogError> {
    let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    let products = match ext.as_str() {
        "json" => match serde_json::from_str::<JsonCatalog>(&raw)? {
            JsonCatalog::Wrapped(f) => f.products,
            JsonCatalog::Bare(p) => p,
        },
        "toml" => toml::from_str::<CatalogFile>(&raw)?.products,
        other => return Err(CatalogError::UnsupportedFormat(other.to_string())),
    };
    validate(products)
}

fn validate(products: Vec<Product>) -> Result<Vec<Product>, CatalogError> {
    let mut seen = HashSet::new();
    for p in &products {
        if !seen.insert(p.id.as_str()) {
            return Err(CatalogError::DuplicateId(p.id.clone()));
        }
    }
    Ok(products)
}

/// 关键词匹配（确定性，按目录顺序返回至多 limit 条）
///
/// 先按整句子串匹配名称/描述；无命中时退化为任一内容词命中。
pub fn keyword_search<'a, I>(products: I, query: &str, limit: usize) -> Vec<Product>
where
    I: IntoIterator<Item = &'a Product>,
    I::IntoIter: Clone,
{
    let needle = query.trim().to_lowercase();
    if needle.is_empty() || limit == 0 {
        return Vec::new();
    }
    let products = products.into_iter();
    let haystack = |p: &Product| format!("{} {}", p.name, p.description).to_lowercase();

    let whole: Vec<Product> = products
        .clone()
        .filter(|p| haystack(p).contains(&needle))
        .take(limit)
        .cloned()
        .collect();
    if !whole.is_empty() {
        return whole;
    }

    let terms = tokenizer::content_tokens(&needle);
    if terms.is_empty() {
        return Vec::new();
    }
    products
        .filter(|p| {
            let text = haystack(p);
            terms.iter().any(|t| text.contains(t.as_str()))
        })
        .take(limit)
        .cloned()
        .collect()
}

fn product(id: &str, name: &str, description: &str, price_cents: u64, quantity: u32, category: &str) -> Product {
    let mut attributes = BTreeMap::new();
    attributes.insert("category".to_string(), category.to_string());
    Product {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        price_cents,
        quantity,
        attributes,
    }
}

/// 内置示例目录（未配置 catalog_path 时使用）
pub fn sample_catalog() -> Vec<Product> {
    vec![
        product("prod-1", "USB Cable", "Braided USB-C to USB-C charging cable, 2 m", 1299, 5, "accessories"),
        product("prod-2", "Wireless Headphones", "Over-ear bluetooth headphones with noise cancelling", 8999, 3, "audio"),
        product("prod-3", "Mechanical Keyboard", "Tenkeyless keyboard with hot-swappable switches", 11900, 4, "peripherals"),
        product("prod-4", "Wireless Mouse", "Ergonomic bluetooth mouse with silent clicks", 2999, 10, "peripherals"),
        product("prod-5", "Laptop Stand", "Adjustable aluminium stand for 13-17 inch laptops", 3999, 0, "accessories"),
        product("prod-6", "Portable Speaker", "Waterproof bluetooth speaker with 12 hour battery", 4999, 6, "audio"),
    ]
}
