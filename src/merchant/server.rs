//! 商户协议 HTTP 服务（axum）
//!
//! 路由由 manifest 的能力声明逐条生成，每个能力名对应一个处理函数；所有修改类端点返回
//! 完整的更新后资源；错误统一返回 `{ code, message, details }`。

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{on, MethodFilter, MethodRouter},
    Json, Router,
};

use super::manifest::{cap, capabilities};
use super::{
    AddItemRequest, Cart, CheckoutSession, CreateCheckoutRequest, Manifest, MerchantStore, Product,
    ProductFilter, SearchRequest, UpdateItemRequest,
};
use crate::core::{AgentError, ErrorCode};
use crate::protocol::CommerceApi;

type SharedStore = State<Arc<MerchantStore>>;
type ApiResult<T> = Result<Json<T>, AgentError>;

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match self.code() {
            Some(ErrorCode::ProductNotFound)
            | Some(ErrorCode::CartNotFound)
            | Some(ErrorCode::CheckoutNotFound) => StatusCode::NOT_FOUND,
            Some(ErrorCode::InsufficientStock) | Some(ErrorCode::InvalidCheckoutState) => {
                StatusCode::CONFLICT
            }
            Some(ErrorCode::EmptyCart) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(ErrorCode::InvalidRequest) => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("merchant request failed: {}", self);
        } else {
            tracing::debug!("merchant request rejected: {}", self);
        }
        (status, Json(self.to_body())).into_response()
    }
}

fn bad_json(rejection: JsonRejection) -> AgentError {
    AgentError::InvalidRequest(rejection.body_text())
}

/// 能力名对应的处理函数
fn endpoint(capability: &str, filter: MethodFilter) -> Option<MethodRouter<Arc<MerchantStore>>> {
    Some(match capability {
        cap::DISCOVERY => on(filter, discovery),
        cap::PRODUCTS_LIST => on(filter, list_products),
        cap::PRODUCTS_GET => on(filter, get_product),
        cap::PRODUCTS_SEARCH => on(filter, search_products),
        cap::CART_CREATE => on(filter, create_cart),
        cap::CART_GET => on(filter, get_cart),
        cap::CART_ADD_ITEM => on(filter, add_item),
        cap::CART_UPDATE_ITEM => on(filter, update_item),
        cap::CART_REMOVE_ITEM => on(filter, remove_item),
        cap::CHECKOUT_CREATE => on(filter, create_checkout),
        cap::CHECKOUT_GET => on(filter, get_checkout),
        cap::CHECKOUT_CONFIRM => on(filter, confirm_checkout),
        _ => return None,
    })
}

fn method_filter(method: &str) -> Option<MethodFilter> {
    match method {
        "GET" => Some(MethodFilter::GET),
        "POST" => Some(MethodFilter::POST),
        "PUT" => Some(MethodFilter::PUT),
        "PATCH" => Some(MethodFilter::PATCH),
        "DELETE" => Some(MethodFilter::DELETE),
        _ => None,
    }
}

/// 清单路径 `/cart/{id}` -> axum 路径 `/cart/:id`
fn route_path(path: &str) -> String {
    path.replace('{', ":").replace('}', "")
}

/// 构建商户协议路由：逐条挂载 manifest 声明的能力
pub fn router(store: Arc<MerchantStore>) -> Router {
    let mut app = Router::new();
    for capability in capabilities() {
        let path = route_path(&capability.path);
        for method in &capability.methods {
            match method_filter(method).and_then(|f| endpoint(&capability.name, f)) {
                Some(route) => app = app.route(&path, route),
                None => tracing::error!(
                    capability = %capability.name,
                    %method,
                    "declared capability has no handler"
                ),
            }
        }
    }
    app.with_state(store)
}

/// 在已绑定的监听器上运行服务，直到 shutdown 完成
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    store: Arc<MerchantStore>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!("merchant service listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn discovery(State(store): SharedStore) -> ApiResult<Manifest> {
    store.discover().await.map(Json)
}

async fn list_products(
    State(store): SharedStore,
    filter: Result<Query<ProductFilter>, QueryRejection>,
) -> ApiResult<Vec<Product>> {
    let Query(filter) = filter.map_err(|e| AgentError::InvalidRequest(e.body_text()))?;
    store.list_products(&filter).await.map(Json)
}

async fn get_product(State(store): SharedStore, Path(id): Path<String>) -> ApiResult<Product> {
    store.get_product(&id).await.map(Json)
}

async fn search_products(
    State(store): SharedStore,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> ApiResult<Vec<Product>> {
    let Json(request) = payload.map_err(bad_json)?;
    store.search_products(&request).await.map(Json)
}

async fn create_cart(State(store): SharedStore) -> Result<(StatusCode, Json<Cart>), AgentError> {
    let cart = store.create_cart().await?;
    Ok((StatusCode::CREATED, Json(cart)))
}

async fn get_cart(State(store): SharedStore, Path(id): Path<String>) -> ApiResult<Cart> {
    store.get_cart(&id).await.map(Json)
}

async fn add_item(
    State(store): SharedStore,
    Path(cart_id): Path<String>,
    payload: Result<Json<AddItemRequest>, JsonRejection>,
) -> ApiResult<Cart> {
    let Json(request) = payload.map_err(bad_json)?;
    store
        .add_item(&cart_id, &request.product_id, request.quantity)
        .await
        .map(Json)
}

async fn update_item(
    State(store): SharedStore,
    Path((cart_id, product_id)): Path<(String, String)>,
    payload: Result<Json<UpdateItemRequest>, JsonRejection>,
) -> ApiResult<Cart> {
    let Json(request) = payload.map_err(bad_json)?;
    store
        .update_item(&cart_id, &product_id, request.quantity)
        .await
        .map(Json)
}

async fn remove_item(
    State(store): SharedStore,
    Path((cart_id, product_id)): Path<(String, String)>,
) -> ApiResult<Cart> {
    store.remove_item(&cart_id, &product_id).await.map(Json)
}

async fn create_checkout(
    State(store): SharedStore,
    payload: Result<Json<CreateCheckoutRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CheckoutSession>), AgentError> {
    let Json(request) = payload.map_err(bad_json)?;
    let session = store.create_checkout(&request.cart_id).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_checkout(
    State(store): SharedStore,
    Path(id): Path<String>,
) -> ApiResult<CheckoutSession> {
    store.get_checkout(&id).await.map(Json)
}

async fn confirm_checkout(
    State(store): SharedStore,
    Path(id): Path<String>,
) -> ApiResult<CheckoutSession> {
    store.confirm_checkout(&id).await.map(Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorBody;
    use crate::merchant::{sample_catalog, PROTOCOL_VERSION};
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    fn app() -> Router {
        router(Arc::new(MerchantStore::new(sample_catalog(), PROTOCOL_VERSION)))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.unwrap_or("").to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_every_declared_capability_is_routable() {
        let app = app();
        for capability in capabilities() {
            let uri = capability
                .path
                .replace("{product_id}", "prod-1")
                .replace("{id}", "unknown");
            for method in &capability.methods {
                let method = Method::from_bytes(method.as_bytes()).unwrap();
                let (status, body) = call(&app, method.clone(), &uri, Some("{}")).await;
                assert_ne!(
                    status,
                    StatusCode::METHOD_NOT_ALLOWED,
                    "{} {} not routed",
                    method,
                    uri
                );
                if status == StatusCode::NOT_FOUND {
                    // 路由存在时 404 必带结构化错误体；路由缺失的 404 没有 body
                    let parsed: Result<ErrorBody, _> = serde_json::from_slice(&body);
                    assert!(parsed.is_ok(), "{} {} is not routed", method, uri);
                }
            }
        }
    }

    #[test]
    fn test_every_declared_capability_has_a_handler() {
        for capability in capabilities() {
            for method in &capability.methods {
                let filter = method_filter(method);
                assert!(filter.is_some(), "{} uses unsupported method {}", capability.name, method);
                assert!(
                    filter.and_then(|f| endpoint(&capability.name, f)).is_some(),
                    "{} has no handler",
                    capability.name
                );
            }
        }
        assert!(endpoint("gift_wrap", MethodFilter::POST).is_none());
    }

    #[tokio::test]
    async fn test_only_declared_routes_are_served() {
        let app = app();
        let caps = capabilities();
        for capability in &caps {
            let uri = capability
                .path
                .replace("{product_id}", "prod-1")
                .replace("{id}", "unknown");
            // 同一路径上未声明的方法一律 405
            for method in [Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
                let declared = caps.iter().any(|c| {
                    c.path == capability.path && c.methods.iter().any(|m| m == method.as_str())
                });
                if declared {
                    continue;
                }
                let (status, _) = call(&app, method.clone(), &uri, Some("{}")).await;
                assert_eq!(
                    status,
                    StatusCode::METHOD_NOT_ALLOWED,
                    "{} {} is served but not declared",
                    method,
                    uri
                );
            }
        }

        // 清单之外的路径不存在
        for uri in ["/orders", "/cart/unknown/items/prod-1/extra", "/admin/stock"] {
            let (status, body) = call(&app, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            assert!(serde_json::from_slice::<ErrorBody>(&body).is_err(), "{uri}");
        }
    }

    #[tokio::test]
    async fn test_discovery_returns_manifest() {
        let (status, body) = call(&app(), Method::GET, "/discovery", None).await;
        assert_eq!(status, StatusCode::OK);
        let manifest: Manifest = serde_json::from_slice(&body).unwrap();
        assert_eq!(manifest.protocol_version, PROTOCOL_VERSION);
        assert!(manifest.has_capability("cart_add_item"));
    }

    #[tokio::test]
    async fn test_cart_flow_over_http() {
        let app = app();
        let (status, body) = call(&app, Method::POST, "/cart", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let cart: Cart = serde_json::from_slice(&body).unwrap();

        let uri = format!("/cart/{}/items", cart.id);
        let (status, body) = call(
            &app,
            Method::POST,
            &uri,
            Some(r#"{"product_id":"prod-1","quantity":2}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let cart: Cart = serde_json::from_slice(&body).unwrap();
        assert_eq!(cart.quantity_of("prod-1"), 2);

        let uri = format!("/cart/{}/items/prod-1", cart.id);
        let (status, body) = call(&app, Method::PATCH, &uri, Some(r#"{"quantity":0}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let cart: Cart = serde_json::from_slice(&body).unwrap();
        assert!(cart.is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_stock_error_body() {
        let app = app();
        let (_, body) = call(&app, Method::POST, "/cart", None).await;
        let cart: Cart = serde_json::from_slice(&body).unwrap();
        let uri = format!("/cart/{}/items", cart.id);
        let (status, body) = call(
            &app,
            Method::POST,
            &uri,
            Some(r#"{"product_id":"prod-2","quantity":99}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, ErrorCode::InsufficientStock);
        assert_eq!(error.details["shortfalls"][0]["product_id"], "prod-2");
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_request() {
        let app = app();
        let (status, body) = call(&app, Method::POST, "/checkout-sessions", Some("not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_list_products_in_stock_filter() {
        let (status, body) = call(&app(), Method::GET, "/products?in_stock_only=true", None).await;
        assert_eq!(status, StatusCode::OK);
        let products: Vec<Product> = serde_json::from_slice(&body).unwrap();
        assert!(products.iter().all(|p| p.quantity > 0));
        assert!(!products.iter().any(|p| p.id == "prod-5"));
    }
}
