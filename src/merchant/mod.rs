//! 商户协议服务：商品 / 购物车 / 结账状态的唯一事实来源，经 HTTP 对外暴露

pub mod catalog;
pub mod manifest;
pub mod server;
pub mod store;
pub mod types;

pub use catalog::{keyword_search, load_catalog, sample_catalog, CatalogError};
pub use manifest::{build_manifest, missing_capabilities, PROTOCOL_VERSION, REQUIRED_CAPABILITIES};
pub use server::{router, serve};
pub use store::MerchantStore;
pub use types::*;
