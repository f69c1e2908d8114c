//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 HandleError 节点决定回复内容以及要清除的会话引用。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为面向用户的安全提示（不暴露内部细节）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::ProductNotFound(_) => RecoveryAction::Inform(
                "I couldn't find a product matching that. Try searching first, then tell me which one to buy."
                    .to_string(),
            ),
            AgentError::InsufficientStock { shortfalls } if !shortfalls.is_empty() => {
                let lines = shortfalls
                    .iter()
                    .map(|s| {
                        format!(
                            "{} (you asked for {}, only {} left)",
                            s.product_id, s.requested, s.available
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                RecoveryAction::Inform(format!(
                    "Sorry, that item is out of stock: {lines}. Your cart was kept: you can change a \
                     quantity (\"change <item> to 1\") or remove an item, then check out again."
                ))
            }
            AgentError::InsufficientStock { .. } => {
                RecoveryAction::Inform("Sorry, that item is out of stock.".to_string())
            }
            AgentError::InvalidCheckoutState { status, .. } => RecoveryAction::ResetCheckout(
                format!("That checkout is already {status}. Say \"checkout\" again to start a new one."),
            ),
            AgentError::CartNotFound(_) => RecoveryAction::ResetCart(
                "Your previous cart is no longer available, so I started over with an empty cart."
                    .to_string(),
            ),
            AgentError::CheckoutNotFound(_) => RecoveryAction::ResetCheckout(
                "I couldn't find your checkout anymore. Say \"checkout\" to start a new one."
                    .to_string(),
            ),
            AgentError::EmptyCart(_) => RecoveryAction::Inform(
                "Your cart is empty, so there is nothing to check out yet.".to_string(),
            ),
            AgentError::InvalidRequest(_) => RecoveryAction::Inform(
                "I couldn't process that request. Could you rephrase it?".to_string(),
            ),
            AgentError::UpstreamUnavailable(_) => RecoveryAction::Inform(
                "The store is temporarily unavailable. Please try again in a moment.".to_string(),
            ),
            AgentError::ConfirmOutcomeUnknown(_) => RecoveryAction::Inform(
                "I couldn't confirm whether your order went through. Ask me to \"checkout\" again and I'll check its status before doing anything else."
                    .to_string(),
            ),
            AgentError::ManifestMismatch { .. } => RecoveryAction::Inform(
                "The store doesn't support that action right now.".to_string(),
            ),
            AgentError::SessionNotFound(_) => RecoveryAction::ResetCart(
                "Your previous session expired, so we're starting fresh.".to_string(),
            ),
            AgentError::RetrievalDegraded(_)
            | AgentError::LlmError(_)
            | AgentError::ProcessStartupFailure(_)
            | AgentError::ConfigError(_) => RecoveryAction::Inform(
                "Something went wrong on my side. Please try again.".to_string(),
            ),
        }
    }
}
