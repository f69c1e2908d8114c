//! 端到端购物流程：Agent -> 工作流 -> 商户（进程内 / HTTP）

use std::sync::Arc;
use std::time::Duration;

use shopbee::agent::Agent;
use shopbee::config::AppConfig;
use shopbee::merchant::{router, sample_catalog, MerchantStore, PROTOCOL_VERSION};
use shopbee::protocol::{Backoff, CommerceApi, ProtocolClient, RetryPolicy};
use shopbee::retrieval::Retriever;
use shopbee::workflow::Intent;

fn in_process() -> (Agent, Arc<MerchantStore>) {
    let store = Arc::new(MerchantStore::new(sample_catalog(), PROTOCOL_VERSION));
    let retriever = Arc::new(Retriever::new(None, sample_catalog()));
    let agent = Agent::from_config(&AppConfig::default(), store.clone(), retriever, None);
    (agent, store)
}

#[tokio::test]
async fn test_search_buy_cart_checkout() {
    let (agent, store) = in_process();

    let turn = agent.handle_turn("u1", "find wireless headphones").await;
    assert_eq!(turn.intent, Intent::Search);
    assert!(turn.degraded);
    assert!(turn.reply.contains("Wireless Headphones"), "{}", turn.reply);
    assert!(turn.reply.contains("results may be limited"));

    let turn = agent.handle_turn("u1", "buy 2 of that one").await;
    assert_eq!(turn.intent, Intent::Buy);
    assert_eq!(
        turn.reply,
        "Added 2 x Wireless Headphones to your cart. Your cart now has 2 item(s)."
    );

    let turn = agent.handle_turn("u1", "show my cart").await;
    assert_eq!(
        turn.reply,
        "Your cart:\n- 2 x Wireless Headphones @ $89.99 = $179.98\nTotal: $179.98"
    );

    let turn = agent.handle_turn("u1", "checkout").await;
    assert_eq!(turn.intent, Intent::Checkout);
    assert!(turn.reply.contains("Your order is confirmed"), "{}", turn.reply);
    assert!(turn.reply.contains("Total charged: $179.98"));
    assert_eq!(store.get_product("prod-2").await.unwrap().quantity, 1);

    let session = agent.sessions().get("u1").await.unwrap();
    assert!(session.cart_id.is_none());
    assert!(session.checkout_id.is_none());

    let turn = agent.handle_turn("u1", "show my cart").await;
    assert_eq!(turn.reply, "Your cart is empty.");
}

#[tokio::test]
async fn test_stock_drops_before_confirm() {
    let (agent, store) = in_process();

    agent
        .handle_turn("u2", "buy 3 wireless headphones")
        .await;
    // 下单前库存被别处买走
    store.set_quantity("prod-2", 1).await.unwrap();

    let turn = agent.handle_turn("u2", "checkout").await;
    assert!(turn.reply.contains("out of stock"), "{}", turn.reply);
    assert!(turn.reply.contains("only 1 left"));
    assert_eq!(store.get_product("prod-2").await.unwrap().quantity, 1);

    // 购物车保留，结账会话作废
    let session = agent.sessions().get("u2").await.unwrap();
    let cart_id = session.cart_id.clone().unwrap();
    assert!(session.checkout_id.is_none());
    assert_eq!(store.get_cart(&cart_id).await.unwrap().quantity_of("prod-2"), 3);
}

#[tokio::test]
async fn test_buying_more_than_stock_is_refused() {
    let (agent, store) = in_process();
    let turn = agent
        .handle_turn("u3", "buy 4 wireless headphones")
        .await;
    assert!(turn.reply.contains("you asked for 4, only 3 left"), "{}", turn.reply);
    assert_eq!(store.get_product("prod-2").await.unwrap().quantity, 3);
}

#[tokio::test]
async fn test_large_quantity_is_passed_through_and_refused() {
    let (agent, store) = in_process();
    let turn = agent.handle_turn("u5", "buy 500 usb cables").await;
    assert!(turn.reply.contains("you asked for 500, only 5 left"), "{}", turn.reply);

    // 不会悄悄改成 1 件
    if let Some(cart_id) = agent.sessions().get("u5").await.unwrap().cart_id {
        assert_eq!(store.get_cart(&cart_id).await.unwrap().quantity_of("prod-1"), 0);
    }
    assert_eq!(store.get_product("prod-1").await.unwrap().quantity, 5);
}

#[tokio::test]
async fn test_search_shows_merchant_stock_after_purchase() {
    let (agent, store) = in_process();
    agent.handle_turn("u6", "buy 3 wireless headphones").await;
    let turn = agent.handle_turn("u6", "checkout").await;
    assert!(turn.reply.contains("Your order is confirmed"), "{}", turn.reply);
    assert_eq!(store.get_product("prod-2").await.unwrap().quantity, 0);

    let turn = agent.handle_turn("u6", "find wireless headphones").await;
    assert!(
        turn.reply.contains("Wireless Headphones - $89.99 (out of stock)"),
        "{}",
        turn.reply
    );
    assert!(!turn.reply.contains("3 in stock"));
}

#[tokio::test]
async fn test_cart_adjusted_after_failed_checkout() {
    let (agent, store) = in_process();
    agent.handle_turn("u7", "buy 3 wireless headphones").await;
    agent.handle_turn("u7", "buy the usb cable").await;
    store.set_quantity("prod-2", 1).await.unwrap();

    let turn = agent.handle_turn("u7", "checkout").await;
    assert!(turn.reply.contains("only 1 left"), "{}", turn.reply);

    let turn = agent.handle_turn("u7", "change the headphones to 1").await;
    assert_eq!(turn.intent, Intent::Cart);
    assert!(
        turn.reply.starts_with("Changed Wireless Headphones to 1.\nYour cart:"),
        "{}",
        turn.reply
    );
    assert!(turn.reply.contains("- 1 x Wireless Headphones @ $89.99 = $89.99"));

    let turn = agent.handle_turn("u7", "remove the usb cable from my cart").await;
    assert!(turn.reply.starts_with("Removed USB Cable from your cart."), "{}", turn.reply);
    assert!(!turn.reply.contains("USB Cable @"));

    let turn = agent.handle_turn("u7", "checkout").await;
    assert!(turn.reply.contains("Your order is confirmed"), "{}", turn.reply);
    assert!(turn.reply.contains("Total charged: $89.99"));
    assert_eq!(store.get_product("prod-2").await.unwrap().quantity, 0);
    assert_eq!(store.get_product("prod-1").await.unwrap().quantity, 5);
}

#[tokio::test]
async fn test_unknown_product_does_not_touch_cart() {
    let (agent, _) = in_process();
    let turn = agent.handle_turn("u4", "buy a toaster").await;
    assert!(turn.reply.contains("couldn't find a product"), "{}", turn.reply);
    assert!(agent.sessions().get("u4").await.unwrap().cart_id.is_none());
}

#[tokio::test]
async fn test_over_http_then_merchant_goes_away() {
    let store = Arc::new(MerchantStore::new(sample_catalog(), PROTOCOL_VERSION));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let app = router(store.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });

    let policy = RetryPolicy {
        timeout: Duration::from_millis(500),
        max_retries: 1,
        base_delay: Duration::from_millis(10),
        backoff: Backoff::Fixed,
    };
    let client = ProtocolClient::new(&format!("http://{addr}"), policy).unwrap();
    let retriever = Arc::new(Retriever::new(None, sample_catalog()));
    let agent = Agent::from_config(&AppConfig::default(), Arc::new(client), retriever, None);

    let turn = agent.handle_turn("web", "buy the usb cable").await;
    assert!(turn.reply.starts_with("Added 1 x USB Cable"), "{}", turn.reply);
    let cart_id = agent.sessions().get("web").await.unwrap().cart_id.unwrap();
    assert_eq!(store.get_cart(&cart_id).await.unwrap().quantity_of("prod-1"), 1);

    stop_tx.send(()).unwrap();
    server.await.unwrap();

    let turn = agent.handle_turn("web", "show my cart").await;
    assert!(turn.reply.contains("temporarily unavailable"), "{}", turn.reply);
    // 上游不可用不丢购物车引用
    assert_eq!(
        agent.sessions().get("web").await.unwrap().cart_id,
        Some(cart_id)
    );
}
