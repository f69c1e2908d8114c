//! shopbee-merchant - 商户协议服务
//!
//! 读取 [merchant] 配置（host / port / catalog_path / protocol_version，可由
//! SHOPBEE__MERCHANT__* 环境变量覆盖），加载商品目录后提供 HTTP 协议服务，
//! 收到 Ctrl+C 或 SIGTERM 时停止接受新连接并等待进行中的请求完成。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use shopbee::config::load_config;
use shopbee::core::ShutdownManager;
use shopbee::merchant::{load_catalog, sample_catalog, serve, MerchantStore};
use shopbee::observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;

    let products = match &cfg.merchant.catalog_path {
        Some(path) => load_catalog(path)
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => {
            tracing::info!("no catalog_path configured, using the built-in sample catalog");
            sample_catalog()
        }
    };
    tracing::info!(products = products.len(), "catalog loaded");

    let store = Arc::new(MerchantStore::new(products, &cfg.merchant.protocol_version));
    let addr = cfg.merchant.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();
    let shutdown = {
        let manager = manager.clone();
        async move { manager.wait_for_shutdown().await }
    };

    serve(listener, store, shutdown)
        .await
        .context("Merchant service failed")?;
    tracing::info!("merchant service stopped");
    Ok(())
}
