//! 工作流引擎
//!
//! 从 DetectIntent 开始逐个执行节点，每个节点执行完由 `Node::next` 决定后继。
//! 商户协议错误在发起调用的节点被捕获写入 state.error，由 HandleError 转成安全的提示，
//! 不会以 Err 形式逃出 run。

use std::sync::Arc;
use std::time::Duration;

use super::graph::Node;
use super::intent::{extract_cart_edit, extract_quantity, IntentRecognizer};
use super::select::{product_terms, select_product, Selection};
use super::state::{AgentState, CartEdit, CartLine, Intent};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::merchant::{
    format_cents, Cart, CheckoutSession, CheckoutStatus, Product, ProductFilter,
};
use crate::protocol::CommerceApi;
use crate::retrieval::Retriever;

const ASSISTANT_PROMPT: &str = "You are a friendly shopping assistant for a small electronics store. \
Answer briefly. You can search the catalog, add products to the cart, show the cart and check out; \
suggest one of those when it helps. Never invent prices or stock levels.";

const HELP_TEXT: &str = "I can help you shop: ask me to search for a product (\"find wireless headphones\"), \
buy something (\"buy the USB cable\"), show your cart, or check out.";

const DEGRADED_NOTE: &str = "(Note: search is running in a reduced mode, so results may be limited.)";

/// 带入闲聊提示词的历史消息条数
const CHAT_HISTORY_WINDOW: usize = 10;

/// 工作流引擎
pub struct WorkflowEngine {
    api: Arc<dyn CommerceApi>,
    retriever: Arc<Retriever>,
    llm: Option<Arc<dyn LlmClient>>,
    intents: IntentRecognizer,
    recovery: RecoveryEngine,
    top_k: usize,
    llm_timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(
        api: Arc<dyn CommerceApi>,
        retriever: Arc<Retriever>,
        llm: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        Self {
            api,
            retriever,
            intents: IntentRecognizer::new(llm.clone()),
            llm,
            recovery: RecoveryEngine::new(),
            top_k: 3,
            llm_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self.intents = IntentRecognizer::new(self.llm.clone()).with_timeout(timeout);
        self
    }

    pub fn api(&self) -> &Arc<dyn CommerceApi> {
        &self.api
    }

    /// 执行一轮，返回经过的节点序列
    pub async fn run(&self, state: &mut AgentState) -> Vec<Node> {
        let mut node = Node::ENTRY;
        let mut trace = Vec::new();
        loop {
            self.execute(node, state).await;
            trace.push(node);
            match node.next(state) {
                Some(next) => node = next,
                None => break,
            }
        }
        tracing::debug!(
            session_id = %state.session_id,
            intent = %state.intent,
            path = ?trace,
            "workflow finished"
        );
        trace
    }

    async fn execute(&self, node: Node, state: &mut AgentState) {
        let result = match node {
            Node::DetectIntent => {
                self.detect_intent(state).await;
                Ok(())
            }
            Node::Retrieve => self.retrieve(state).await,
            Node::SelectProduct => self.select(state),
            Node::Buy => self.buy(state).await,
            Node::Cart => self.cart(state).await,
            Node::Checkout => self.checkout(state).await,
            Node::HandleError => {
                self.handle_error(state);
                Ok(())
            }
            Node::GenerateResponse => {
                self.generate_response(state).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(session_id = %state.session_id, %node, "node failed: {}", e);
            state.fail(e);
        }
    }

    async fn detect_intent(&self, state: &mut AgentState) {
        state.intent = self
            .intents
            .recognize(&state.user_text, &state.history)
            .await;
        state.quantity = extract_quantity(&state.user_text);
        if state.intent == Intent::Cart {
            state.cart_edit = extract_cart_edit(&state.user_text);
        }
        tracing::info!(
            session_id = %state.session_id,
            intent = %state.intent,
            quantity = state.quantity,
            "intent detected"
        );
    }

    async fn retrieve(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let terms = product_terms(&state.user_text);

        // 「买那个」「第二个」：沿用上一轮展示的候选
        if state.intent == Intent::Buy && terms.is_empty() && !state.last_candidates.is_empty() {
            let mut products = Vec::with_capacity(state.last_candidates.len());
            for id in &state.last_candidates {
                products.push(self.api.get_product(id).await?);
            }
            state.candidates = products;
            return Ok(());
        }

        // 没有商品词的浏览请求（「你们卖什么」）直接列出在售商品
        if state.intent == Intent::Search && terms.is_empty() {
            let filter = ProductFilter {
                in_stock_only: true,
                ..Default::default()
            };
            let mut products = self.api.list_products(&filter).await?;
            products.truncate(self.top_k);
            state.candidates = products;
            return Ok(());
        }

        let query = if terms.is_empty() {
            state.user_text.clone()
        } else {
            terms.join(" ")
        };
        let outcome = self
            .retriever
            .search_live(self.api.as_ref(), &query, self.top_k)
            .await?;
        state.candidates = outcome.products;
        state.retrieval_degraded = outcome.degraded;
        Ok(())
    }

    fn select(&self, state: &mut AgentState) -> Result<(), AgentError> {
        match select_product(&state.user_text, &state.candidates)? {
            Selection::Selected(id) => {
                tracing::debug!(session_id = %state.session_id, product_id = %id, "product selected");
                state.selected_product_id = Some(id);
            }
            Selection::Ambiguous => state.needs_clarification = true,
        }
        Ok(())
    }

    async fn buy(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let product_id = state
            .selected_product_id
            .clone()
            .ok_or_else(|| AgentError::ProductNotFound(state.user_text.clone()))?;

        let cart_id = match &state.cart_id {
            Some(id) => id.clone(),
            None => {
                let cart = self.api.create_cart().await?;
                tracing::info!(session_id = %state.session_id, cart_id = %cart.id, "cart created");
                state.cart_id = Some(cart.id.clone());
                cart.id
            }
        };

        let cart = self
            .api
            .add_item(&cart_id, &product_id, state.quantity)
            .await?;
        // 购物车已变化，旧的待确认结账作废
        state.checkout_id = None;
        state.cart = Some(cart);
        Ok(())
    }

    async fn cart(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let Some(cart_id) = state.cart_id.clone() else {
            return Ok(());
        };
        let mut cart = self.api.get_cart(&cart_id).await?;
        let mut products = Vec::with_capacity(cart.items.len());
        for item in &cart.items {
            products.push(self.api.get_product(&item.product_id).await?);
        }

        if let Some(edit) = state.cart_edit.filter(|_| !cart.is_empty()) {
            match select_product(&state.user_text, &products)? {
                Selection::Selected(product_id) => {
                    cart = match edit {
                        CartEdit::Remove => self.api.remove_item(&cart_id, &product_id).await?,
                        CartEdit::SetQuantity(n) => {
                            self.api.update_item(&cart_id, &product_id, n).await?
                        }
                    };
                    // 购物车已变化，旧的待确认结账作废
                    state.checkout_id = None;
                    let name = products
                        .iter()
                        .find(|p| p.id == product_id)
                        .map_or(product_id.as_str(), |p| p.name.as_str());
                    tracing::info!(
                        session_id = %state.session_id,
                        product_id = %product_id,
                        ?edit,
                        "cart edited"
                    );
                    state.cart_notice = Some(match edit {
                        CartEdit::Remove => format!("Removed {name} from your cart."),
                        CartEdit::SetQuantity(n) => format!("Changed {name} to {n}."),
                    });
                }
                Selection::Ambiguous => state.needs_clarification = true,
            }
        }

        state.cart_lines = cart_lines(&cart, &products);
        state.cart = Some(cart);
        Ok(())
    }

    async fn checkout(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let cart_id = state
            .cart_id
            .clone()
            .ok_or_else(|| AgentError::EmptyCart("no cart".to_string()))?;

        // 先核对上一次的结账会话：可能仍待确认，也可能上次结果不明但其实已确认
        let mut pending = None;
        if let Some(id) = state.checkout_id.clone() {
            match self.api.get_checkout(&id).await {
                Ok(existing) if existing.status == CheckoutStatus::Pending => pending = Some(existing),
                Ok(existing) if existing.status == CheckoutStatus::Confirmed => {
                    return self.apply_confirm_result(state, existing);
                }
                Ok(_) | Err(AgentError::CheckoutNotFound(_)) => state.checkout_id = None,
                Err(e) => return Err(e),
            }
        }

        let checkout = match pending {
            Some(existing) => existing,
            None => {
                let created = self.api.create_checkout(&cart_id).await?;
                tracing::info!(
                    session_id = %state.session_id,
                    checkout_id = %created.id,
                    total_cents = created.total_cents,
                    "checkout session created"
                );
                state.checkout_id = Some(created.id.clone());
                created
            }
        };

        let result = match self.api.confirm_checkout(&checkout.id).await {
            Err(AgentError::ConfirmOutcomeUnknown(_)) => {
                tracing::warn!(checkout_id = %checkout.id, "confirm outcome unknown, reading checkout back");
                match self.api.get_checkout(&checkout.id).await {
                    Ok(read_back) if read_back.status != CheckoutStatus::Pending => read_back,
                    _ => return Err(AgentError::ConfirmOutcomeUnknown(checkout.id.clone())),
                }
            }
            other => other?,
        };
        self.apply_confirm_result(state, result)
    }

    fn apply_confirm_result(
        &self,
        state: &mut AgentState,
        checkout: CheckoutSession,
    ) -> Result<(), AgentError> {
        match checkout.status {
            CheckoutStatus::Confirmed => {
                tracing::info!(
                    session_id = %state.session_id,
                    checkout_id = %checkout.id,
                    "checkout confirmed"
                );
                state.cart_id = None;
                state.checkout_id = None;
                state.checkout = Some(checkout);
                Ok(())
            }
            CheckoutStatus::Failed => {
                state.checkout_id = None;
                let shortfalls = checkout.shortfalls.clone();
                state.checkout = Some(checkout);
                Err(AgentError::InsufficientStock { shortfalls })
            }
            CheckoutStatus::Pending => Err(AgentError::ConfirmOutcomeUnknown(checkout.id)),
        }
    }

    fn handle_error(&self, state: &mut AgentState) {
        let Some(err) = &state.error else {
            return;
        };
        let action = self.recovery.handle(err);
        match &action {
            RecoveryAction::ResetCart(_) => {
                state.cart_id = None;
                state.checkout_id = None;
            }
            RecoveryAction::ResetCheckout(_) => state.checkout_id = None,
            RecoveryAction::Inform(_) => {}
        }
        tracing::info!(
            session_id = %state.session_id,
            error = %err,
            action = ?action,
            "turn recovered from error"
        );
        state.reply = action.message().to_string();
    }

    async fn generate_response(&self, state: &mut AgentState) {
        if state.error.is_none() {
            state.reply = match state.intent {
                Intent::Search => search_reply(state),
                Intent::Buy => buy_reply(state),
                Intent::Cart => cart_reply(state),
                Intent::Checkout => checkout_reply(state),
                Intent::General => self.general_reply(state).await,
            };
        }
        if state.reply.trim().is_empty() {
            state.reply = HELP_TEXT.to_string();
        }
        if state.retrieval_degraded {
            state.reply.push('\n');
            state.reply.push_str(DEGRADED_NOTE);
        }
    }

    async fn general_reply(&self, state: &AgentState) -> String {
        let Some(llm) = &self.llm else {
            return HELP_TEXT.to_string();
        };
        if state.user_text.is_empty() {
            return HELP_TEXT.to_string();
        }
        let start = state.history.len().saturating_sub(CHAT_HISTORY_WINDOW);
        let mut messages = vec![Message::system(ASSISTANT_PROMPT)];
        messages.extend(state.history[start..].iter().cloned());
        messages.push(Message::user(state.user_text.clone()));

        match tokio::time::timeout(self.llm_timeout, llm.complete(&messages)).await {
            Ok(Ok(reply)) if !reply.trim().is_empty() => reply.trim().to_string(),
            Ok(Ok(_)) => HELP_TEXT.to_string(),
            Ok(Err(e)) => {
                tracing::warn!("{}", AgentError::LlmError(e));
                HELP_TEXT.to_string()
            }
            Err(_) => {
                tracing::warn!("chat reply timed out after {:?}", self.llm_timeout);
                HELP_TEXT.to_string()
            }
        }
    }
}

fn cart_lines(cart: &Cart, products: &[Product]) -> Vec<CartLine> {
    cart.items
        .iter()
        .filter_map(|item| {
            let product = products.iter().find(|p| p.id == item.product_id)?;
            Some(CartLine {
                product_id: product.id.clone(),
                name: product.name.clone(),
                quantity: item.quantity,
                unit_price_cents: product.price_cents,
            })
        })
        .collect()
}

fn product_line(index: usize, product: &Product) -> String {
    let stock = if product.in_stock() {
        format!("{} in stock", product.quantity)
    } else {
        "out of stock".to_string()
    };
    format!(
        "{}. {} - {} ({})",
        index + 1,
        product.name,
        product.display_price(),
        stock
    )
}

fn candidate_list(state: &mut AgentState) -> String {
    state.last_candidates = state.candidates.iter().map(|p| p.id.clone()).collect();
    state
        .candidates
        .iter()
        .enumerate()
        .map(|(i, p)| product_line(i, p))
        .collect::<Vec<_>>()
        .join("\n")
}

fn search_reply(state: &mut AgentState) -> String {
    if state.candidates.is_empty() {
        return format!(
            "I couldn't find any products matching \"{}\".",
            state.user_text
        );
    }
    format!("Here's what I found:\n{}", candidate_list(state))
}

fn buy_reply(state: &mut AgentState) -> String {
    if state.needs_clarification {
        return format!(
            "Which one did you mean?\n{}\nTell me the name or say \"the first one\", \"the second one\"...",
            candidate_list(state)
        );
    }
    let name = state
        .selected_product()
        .map(|p| p.name.clone())
        .or_else(|| state.selected_product_id.clone())
        .unwrap_or_default();
    let items: u32 = state
        .cart
        .as_ref()
        .map(|c| c.items.iter().map(|i| i.quantity).sum())
        .unwrap_or(0);
    format!(
        "Added {} x {} to your cart. Your cart now has {} item(s).",
        state.quantity, name, items
    )
}

fn cart_reply(state: &AgentState) -> String {
    let listing = cart_listing(state);
    if state.needs_clarification {
        return format!("Which item do you want to change?\n{listing}\nTell me the product name.");
    }
    match &state.cart_notice {
        Some(notice) => format!("{notice}\n{listing}"),
        None => listing,
    }
}

fn cart_listing(state: &AgentState) -> String {
    if state.cart_lines.is_empty() {
        return "Your cart is empty.".to_string();
    }
    let mut total = 0u64;
    let lines: Vec<String> = state
        .cart_lines
        .iter()
        .map(|l| {
            let subtotal = l.unit_price_cents * u64::from(l.quantity);
            total += subtotal;
            format!(
                "- {} x {} @ {} = {}",
                l.quantity,
                l.name,
                format_cents(l.unit_price_cents),
                format_cents(subtotal)
            )
        })
        .collect();
    format!(
        "Your cart:\n{}\nTotal: {}",
        lines.join("\n"),
        format_cents(total)
    )
}

fn checkout_reply(state: &AgentState) -> String {
    match &state.checkout {
        Some(checkout) => {
            let lines: Vec<String> = checkout
                .lines
                .iter()
                .map(|l| format!("- {} x {}", l.quantity, l.name))
                .collect();
            format!(
                "Your order is confirmed (checkout {}).\n{}\nTotal charged: {}",
                checkout.id,
                lines.join("\n"),
                format_cents(checkout.total_cents)
            )
        }
        None => "Your cart is empty, so there is nothing to check out yet.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::merchant::{sample_catalog, MerchantStore, PROTOCOL_VERSION};
    use crate::retrieval::{ScoredProduct, VectorIndex};
    use async_trait::async_trait;

    fn engine_with(llm: Option<Arc<dyn LlmClient>>) -> (WorkflowEngine, Arc<MerchantStore>) {
        let store = Arc::new(MerchantStore::new(sample_catalog(), PROTOCOL_VERSION));
        let retriever = Arc::new(Retriever::new(None, sample_catalog()));
        let engine = WorkflowEngine::new(store.clone(), retriever, llm);
        (engine, store)
    }

    fn turn(text: &str) -> AgentState {
        AgentState {
            session_id: "test".to_string(),
            user_text: text.to_string(),
            quantity: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_general_without_llm_returns_help() {
        let (engine, _) = engine_with(None);
        let mut state = turn("hello");
        let trace = engine.run(&mut state).await;
        assert_eq!(trace, vec![Node::DetectIntent, Node::GenerateResponse]);
        assert_eq!(state.reply, HELP_TEXT);
    }

    #[tokio::test]
    async fn test_general_uses_llm_reply() {
        let mock = Arc::new(MockLlmClient::with_replies(["general", "Hi! How can I help?"]));
        let (engine, _) = engine_with(Some(mock));
        let mut state = turn("hello");
        engine.run(&mut state).await;
        assert_eq!(state.reply, "Hi! How can I help?");
    }

    #[tokio::test]
    async fn test_search_is_annotated_when_degraded() {
        let (engine, _) = engine_with(None);
        let mut state = turn("find wireless headphones");
        let trace = engine.run(&mut state).await;
        assert_eq!(
            trace,
            vec![Node::DetectIntent, Node::Retrieve, Node::GenerateResponse]
        );
        assert!(state.retrieval_degraded);
        assert!(state.reply.contains("Wireless Headphones"));
        assert!(state.reply.contains("results may be limited"));
        assert_eq!(state.last_candidates, vec!["prod-2".to_string()]);
    }

    #[tokio::test]
    async fn test_semantic_search_is_not_annotated() {
        struct OneHit;

        #[async_trait]
        impl VectorIndex for OneHit {
            async fn query(&self, _text: &str, _k: usize) -> Result<Vec<ScoredProduct>, String> {
                Ok(vec![ScoredProduct {
                    product: sample_catalog()[2].clone(),
                    score: 0.93,
                }])
            }
        }

        let store = Arc::new(MerchantStore::new(sample_catalog(), PROTOCOL_VERSION));
        let retriever = Arc::new(Retriever::new(Some(Arc::new(OneHit)), sample_catalog()));
        let engine = WorkflowEngine::new(store, retriever, None);
        let mut state = turn("search for a clicky keyboard");
        engine.run(&mut state).await;
        assert!(!state.retrieval_degraded);
        assert!(state.reply.contains("Mechanical Keyboard"));
        assert!(!state.reply.contains("results may be limited"));
    }

    #[tokio::test]
    async fn test_cart_without_cart_is_empty_message() {
        let (engine, _) = engine_with(None);
        let mut state = turn("show my cart");
        let trace = engine.run(&mut state).await;
        assert_eq!(trace, vec![Node::DetectIntent, Node::Cart, Node::GenerateResponse]);
        assert_eq!(state.reply, "Your cart is empty.");
    }

    #[tokio::test]
    async fn test_checkout_without_cart_is_handled() {
        let (engine, _) = engine_with(None);
        let mut state = turn("checkout");
        let trace = engine.run(&mut state).await;
        assert_eq!(
            trace,
            vec![
                Node::DetectIntent,
                Node::Checkout,
                Node::HandleError,
                Node::GenerateResponse
            ]
        );
        assert!(state.reply.contains("cart is empty"));
    }

    #[tokio::test]
    async fn test_ambiguous_buy_asks_then_ordinal_resolves() {
        let (engine, store) = engine_with(None);
        let mut state = turn("buy something wireless");
        engine.run(&mut state).await;
        // 「wireless」同时命中耳机与鼠标，同分按排名取耳机
        assert_eq!(state.selected_product_id.as_deref(), Some("prod-2"));

        let mut state = turn("buy the one");
        state.last_candidates = vec!["prod-2".to_string(), "prod-4".to_string()];
        let trace = engine.run(&mut state).await;
        assert_eq!(
            trace,
            vec![
                Node::DetectIntent,
                Node::Retrieve,
                Node::SelectProduct,
                Node::GenerateResponse
            ]
        );
        assert!(state.reply.starts_with("Which one did you mean?"));

        let mut next = turn("the second one");
        next.last_candidates = state.last_candidates.clone();
        engine.run(&mut next).await;
        assert_eq!(next.selected_product_id.as_deref(), Some("prod-4"));
        let cart_id = next.cart_id.clone().unwrap();
        assert_eq!(store.get_cart(&cart_id).await.unwrap().quantity_of("prod-4"), 1);
    }

    #[tokio::test]
    async fn test_unknown_product_is_not_found_message() {
        let (engine, _) = engine_with(None);
        let mut state = turn("buy a toaster");
        engine.run(&mut state).await;
        assert!(matches!(state.error, Some(AgentError::ProductNotFound(_))));
        assert!(state.reply.contains("couldn't find a product"));
        assert!(state.cart_id.is_none());
    }

    #[tokio::test]
    async fn test_cart_edit_without_product_name_asks_which() {
        let (engine, store) = engine_with(None);
        let cart = store.create_cart().await.unwrap();
        store.add_item(&cart.id, "prod-1", 1).await.unwrap();
        store.add_item(&cart.id, "prod-4", 2).await.unwrap();

        let mut state = turn("remove it");
        state.cart_id = Some(cart.id.clone());
        let trace = engine.run(&mut state).await;
        assert_eq!(trace, vec![Node::DetectIntent, Node::Cart, Node::GenerateResponse]);
        assert!(state.reply.starts_with("Which item do you want to change?"), "{}", state.reply);
        assert_eq!(store.get_cart(&cart.id).await.unwrap().items.len(), 2);

        let mut state = turn("set the mouse to 0");
        state.cart_id = Some(cart.id.clone());
        state.checkout_id = Some("chk-stale".to_string());
        engine.run(&mut state).await;
        assert_eq!(
            state.reply,
            "Removed Wireless Mouse from your cart.\nYour cart:\n- 1 x USB Cable @ $12.99 = $12.99\nTotal: $12.99"
        );
        assert!(state.checkout_id.is_none());
        assert_eq!(store.get_cart(&cart.id).await.unwrap().quantity_of("prod-4"), 0);
    }

    #[tokio::test]
    async fn test_cart_edit_beyond_stock_is_refused() {
        let (engine, store) = engine_with(None);
        let cart = store.create_cart().await.unwrap();
        store.add_item(&cart.id, "prod-2", 1).await.unwrap();

        let mut state = turn("change the headphones to 7");
        state.cart_id = Some(cart.id.clone());
        engine.run(&mut state).await;
        assert!(matches!(state.error, Some(AgentError::InsufficientStock { .. })));
        assert!(state.reply.contains("you asked for 7, only 3 left"), "{}", state.reply);
        assert_eq!(store.get_cart(&cart.id).await.unwrap().quantity_of("prod-2"), 1);
    }
}
