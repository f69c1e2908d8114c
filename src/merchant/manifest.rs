//! 能力清单（discovery manifest）
//!
//! 路由表由同一份能力声明生成（server::router 逐条挂载），清单里有的一定可路由，
//! 没声明的路由不存在。

use super::{Capability, Manifest};

pub const PROTOCOL_VERSION: &str = "2026-01-ucp";

/// 能力名常量（编排层据此校验上游是否具备所需能力）
pub mod cap {
    pub const DISCOVERY: &str = "discovery";
    pub const PRODUCTS_LIST: &str = "products_list";
    pub const PRODUCTS_GET: &str = "products_get";
    pub const PRODUCTS_SEARCH: &str = "products_search";
    pub const CART_CREATE: &str = "cart_create";
    pub const CART_GET: &str = "cart_get";
    pub const CART_ADD_ITEM: &str = "cart_add_item";
    pub const CART_UPDATE_ITEM: &str = "cart_update_item";
    pub const CART_REMOVE_ITEM: &str = "cart_remove_item";
    pub const CHECKOUT_CREATE: &str = "checkout_create";
    pub const CHECKOUT_GET: &str = "checkout_get";
    pub const CHECKOUT_CONFIRM: &str = "checkout_confirm";
}

/// (名称, 方法, 路径模式)
const CAPABILITIES: &[(&str, &str, &str)] = &[
    (cap::DISCOVERY, "GET", "/discovery"),
    (cap::PRODUCTS_LIST, "GET", "/products"),
    (cap::PRODUCTS_GET, "GET", "/products/{id}"),
    (cap::PRODUCTS_SEARCH, "POST", "/products/search"),
    (cap::CART_CREATE, "POST", "/cart"),
    (cap::CART_GET, "GET", "/cart/{id}"),
    (cap::CART_ADD_ITEM, "POST", "/cart/{id}/items"),
    (cap::CART_UPDATE_ITEM, "PATCH", "/cart/{id}/items/{product_id}"),
    (cap::CART_REMOVE_ITEM, "DELETE", "/cart/{id}/items/{product_id}"),
    (cap::CHECKOUT_CREATE, "POST", "/checkout-sessions"),
    (cap::CHECKOUT_GET, "GET", "/checkout-sessions/{id}"),
    (cap::CHECKOUT_CONFIRM, "POST", "/checkout-sessions/{id}/confirm"),
];

/// 编排层运行所需的最小能力集合
pub const REQUIRED_CAPABILITIES: &[&str] = &[
    cap::DISCOVERY,
    cap::PRODUCTS_LIST,
    cap::CART_CREATE,
    cap::CART_GET,
    cap::CART_ADD_ITEM,
    cap::CHECKOUT_CREATE,
    cap::CHECKOUT_GET,
    cap::CHECKOUT_CONFIRM,
];

pub fn capabilities() -> Vec<Capability> {
    CAPABILITIES
        .iter()
        .map(|(name, method, path)| Capability {
            name: name.to_string(),
            methods: vec![method.to_string()],
            path: path.to_string(),
        })
        .collect()
}

pub fn build_manifest(protocol_version: &str) -> Manifest {
    Manifest {
        protocol_version: protocol_version.to_string(),
        capabilities: capabilities(),
    }
}

/// 清单中缺失的能力名；为空表示清单覆盖了 required
pub fn missing_capabilities(manifest: &Manifest, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !manifest.has_capability(name))
        .map(|name| name.to_string())
        .collect()
}
