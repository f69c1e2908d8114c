//! 错误分类与恢复动作
//!
//! AgentError 是全系统统一的错误分类：商户协议错误（缺货、商品不存在、结账状态非法）、
//! 上游不可用、检索降级、进程启动失败、会话失效。协议错误可经 ErrorBody 在 HTTP 两端往返。
//! 与 RecoveryEngine 配合：HandleError 节点根据 AgentError 决定回复内容与会话清理动作。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::merchant::{CheckoutStatus, StockShortfall};

/// 协议错误码（稳定、机器可读）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProductNotFound,
    InsufficientStock,
    InvalidCheckoutState,
    CartNotFound,
    CheckoutNotFound,
    EmptyCart,
    InvalidRequest,
}

/// 统一错误响应体：`{ code, message, details }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

/// 编排核心运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("Insufficient stock: {}", describe_shortfalls(.shortfalls))]
    InsufficientStock { shortfalls: Vec<StockShortfall> },

    /// 对非 pending 的结账会话执行 confirm
    #[error("Invalid checkout state: {checkout_id} is {status}")]
    InvalidCheckoutState {
        checkout_id: String,
        status: CheckoutStatus,
    },

    #[error("Cart not found: {0}")]
    CartNotFound(String),

    #[error("Checkout session not found: {0}")]
    CheckoutNotFound(String),

    #[error("Cart is empty: {0}")]
    EmptyCart(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Manifest 未声明编排所需的能力（集成期检查）
    #[error("Manifest mismatch, missing capabilities: {}", .missing.join(", "))]
    ManifestMismatch { missing: Vec<String> },

    /// 重试耗尽或不可重试的连接级失败
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// confirm 请求可能已送达但未拿到响应，不能盲目重试
    #[error("Checkout confirmation outcome unknown: {0}")]
    ConfirmOutcomeUnknown(String),

    /// 语义检索失败、已使用关键词兜底（不是失败，仅用于标注与日志）
    #[error("Retrieval degraded: {0}")]
    RetrievalDegraded(String),

    #[error("Process startup failure: {0}")]
    ProcessStartupFailure(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

fn describe_shortfalls(shortfalls: &[StockShortfall]) -> String {
    shortfalls
        .iter()
        .map(|s| {
            format!(
                "{} (requested {}, available {})",
                s.product_id, s.requested, s.available
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl AgentError {
    /// 协议层错误码；非协议错误返回 None
    pub fn code(&self) -> Option<ErrorCode> {
        Some(match self {
            AgentError::ProductNotFound(_) => ErrorCode::ProductNotFound,
            AgentError::InsufficientStock { .. } => ErrorCode::InsufficientStock,
            AgentError::InvalidCheckoutState { .. } => ErrorCode::InvalidCheckoutState,
            AgentError::CartNotFound(_) => ErrorCode::CartNotFound,
            AgentError::CheckoutNotFound(_) => ErrorCode::CheckoutNotFound,
            AgentError::EmptyCart(_) => ErrorCode::EmptyCart,
            AgentError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            _ => return None,
        })
    }

    /// 转为 HTTP 错误响应体
    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            AgentError::ProductNotFound(id) => json!({ "product_id": id }),
            AgentError::InsufficientStock { shortfalls } => json!({ "shortfalls": shortfalls }),
            AgentError::InvalidCheckoutState {
                checkout_id,
                status,
            } => json!({ "checkout_id": checkout_id, "status": status }),
            AgentError::CartNotFound(id) | AgentError::EmptyCart(id) => json!({ "cart_id": id }),
            AgentError::CheckoutNotFound(id) => json!({ "checkout_id": id }),
            _ => Value::Null,
        };
        ErrorBody {
            code: self.code().unwrap_or(ErrorCode::InvalidRequest),
            message: self.to_string(),
            details,
        }
    }

    /// 从 HTTP 错误响应体还原为类型化错误
    pub fn from_body(body: ErrorBody) -> Self {
        let detail_str = |key: &str| {
            body.details
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        match body.code {
            ErrorCode::ProductNotFound => AgentError::ProductNotFound(detail_str("product_id")),
            ErrorCode::InsufficientStock => {
                let shortfalls = body
                    .details
                    .get("shortfalls")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                AgentError::InsufficientStock { shortfalls }
            }
            ErrorCode::InvalidCheckoutState => {
                let status = body
                    .details
                    .get("status")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or(CheckoutStatus::Failed);
                AgentError::InvalidCheckoutState {
                    checkout_id: detail_str("checkout_id"),
                    status,
                }
            }
            ErrorCode::CartNotFound => AgentError::CartNotFound(detail_str("cart_id")),
            ErrorCode::CheckoutNotFound => AgentError::CheckoutNotFound(detail_str("checkout_id")),
            ErrorCode::EmptyCart => AgentError::EmptyCart(detail_str("cart_id")),
            ErrorCode::InvalidRequest => AgentError::InvalidRequest(body.message),
        }
    }
}

/// 恢复引擎根据错误类型给出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 告知用户，会话状态保持不变
    Inform(String),
    /// 会话引用的购物车已失效：清除 cart_id（以及依附于它的 checkout_id）后告知用户
    ResetCart(String),
    /// 会话引用的结账会话已失效：清除 checkout_id 后告知用户
    ResetCheckout(String),
}

impl RecoveryAction {
    pub fn message(&self) -> &str {
        match self {
            RecoveryAction::Inform(m)
            | RecoveryAction::ResetCart(m)
            | RecoveryAction::ResetCheckout(m) => m,
        }
    }
}
