//! 意图识别模块
//!
//! 优先由 LLM 分类（提示词中带入最近对话）；LLM 未配置、调用失败、超时或返回无法解析的标签时，
//! 退回确定性关键词规则。购买数量从原文中提取。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;

use super::state::{CartEdit, Intent};
use crate::llm::LlmClient;
use crate::memory::Message;

const CLASSIFIER_PROMPT: &str = r#"You are the intent classifier of a shopping assistant.
Classify the user's latest message using the conversation for context.

Output ONLY one of these labels (no explanation):
- search: looking for products, asking what is available
- buy: wants to add a product to the cart (including "that one", "the second one")
- cart: wants to see the cart, or change a quantity / remove an item in it
- checkout: wants to pay / place the order / check out
- general: anything else (greetings, questions about the store)

Output format: just the label, nothing else."#;

/// 带入提示词的历史消息条数
const HISTORY_WINDOW: usize = 6;

/// 意图识别器
pub struct IntentRecognizer {
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl IntentRecognizer {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            llm,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 识别用户意图
    pub async fn recognize(&self, user_input: &str, history: &[Message]) -> Intent {
        if user_input.trim().is_empty() {
            return Intent::General;
        }
        if let Some(llm) = &self.llm {
            match self.llm_recognize(llm.as_ref(), user_input, history).await {
                Ok(intent) => return intent,
                Err(e) => tracing::warn!("intent LLM unavailable, using keyword rules: {}", e),
            }
        }
        fast_match(user_input)
    }

    /// 使用 LLM 识别意图
    async fn llm_recognize(
        &self,
        llm: &dyn LlmClient,
        user_input: &str,
        history: &[Message],
    ) -> Result<Intent, String> {
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        let mut messages = Vec::with_capacity(HISTORY_WINDOW + 2);
        messages.push(Message::system(CLASSIFIER_PROMPT));
        messages.extend(history[start..].iter().cloned());
        messages.push(Message::user(user_input));

        let response = tokio::time::timeout(self.timeout, llm.complete(&messages))
            .await
            .map_err(|_| format!("timed out after {:?}", self.timeout))??;

        let label = response.split_whitespace().next().unwrap_or_default();
        Intent::from_label(label).ok_or_else(|| format!("unparsable intent label: {response:?}"))
    }
}

const REMOVE_PATTERN: &str =
    r"(?i)\b(remove|delete|drop)\b|\btake\b.*\bout\b|删除|移除|去掉|拿掉|不要了";

const SET_QUANTITY_PATTERN: &str =
    r"(?i)\b(?:change|update|set|make|reduce|decrease|increase|lower|raise)\b.*?\bto\s+(\d+)\b|改[成为]\s*(\d+)";

fn keyword_rules() -> &'static [(Intent, Regex)] {
    static RULES: OnceLock<Vec<(Intent, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        // 顺序即优先级：「加入购物车」属于 buy 而不是 cart，「把鼠标拿出购物车」属于 cart
        [
            (
                Intent::Checkout,
                r"(?i)\b(check\s*out|checkout|pay|payment|place (?:my |the )?order|complete (?:my |the )?(?:order|purchase))\b|结账|付款|下单",
            ),
            (Intent::Cart, REMOVE_PATTERN),
            (Intent::Cart, SET_QUANTITY_PATTERN),
            (
                Intent::Buy,
                r"(?i)\b(buy|purchase|add|take|grab|order|i'?ll have|(?:that|this|the (?:first|second|third|fourth|fifth|last)) one)\b|买|加入|来一?个|第.个",
            ),
            (
                Intent::Cart,
                r"(?i)\b(cart|basket|bag)\b|购物车",
            ),
            (
                Intent::Search,
                r"(?i)\b(search|find|show|looking|look for|do you (?:have|sell)|any|what .*(?:sell|have)|recommend)\b|搜索|找|有没有|推荐",
            ),
        ]
        .into_iter()
        .filter_map(|(intent, pattern)| Regex::new(pattern).ok().map(|re| (intent, re)))
        .collect()
    })
}

/// 关键词规则（不调用 LLM）
pub fn fast_match(input: &str) -> Intent {
    keyword_rules()
        .iter()
        .find(|(_, re)| re.is_match(input))
        .map(|(intent, _)| *intent)
        .unwrap_or(Intent::General)
}

/// 识别对购物车已有商品的修改（删除 / 改数量）；数量改为 0 视同删除
pub fn extract_cart_edit(input: &str) -> Option<CartEdit> {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    let (remove, set) = PATTERNS
        .get_or_init(|| {
            let remove = Regex::new(REMOVE_PATTERN).ok()?;
            let set = Regex::new(SET_QUANTITY_PATTERN).ok()?;
            Some((remove, set))
        })
        .as_ref()?;

    if let Some(caps) = set.captures(input) {
        let digits = caps.get(1).or_else(|| caps.get(2))?;
        return Some(match digits.as_str().parse::<u32>().unwrap_or(u32::MAX) {
            0 => CartEdit::Remove,
            n => CartEdit::SetQuantity(n),
        });
    }
    remove.is_match(input).then_some(CartEdit::Remove)
}

/// 提取购买数量：阿拉伯数字、英文数词或 `x2`；无则为 1
///
/// 数字原样返回（超过 u32 的按 u32::MAX），是否有货由商户判定。
pub fn extract_quantity(input: &str) -> u32 {
    static NUMBER: OnceLock<Option<Regex>> = OnceLock::new();
    let number = NUMBER.get_or_init(|| Regex::new(r"(?i)\b(?:x\s*)?(\d+)\b").ok());

    let lower = input.to_lowercase();
    if let Some(re) = number {
        for caps in re.captures_iter(&lower) {
            // 跳过序数（1st / 2nd）以及型号中的数字（USB-C 3.0、13-17 inch）
            let Some(m) = caps.get(1) else { continue };
            let after = &lower[m.end()..];
            let before = &lower[..m.start()];
            if after.starts_with(|c: char| c.is_ascii_alphabetic() || c == '.' || c == '-')
                || before.ends_with(|c: char| c == '-' || c == '.')
            {
                continue;
            }
            return m.as_str().parse::<u32>().unwrap_or(u32::MAX);
        }
    }

    const WORDS: [(&str, u32); 10] = [
        ("a couple of", 2),
        ("two", 2),
        ("three", 3),
        ("four", 4),
        ("five", 5),
        ("six", 6),
        ("seven", 7),
        ("eight", 8),
        ("nine", 9),
        ("ten", 10),
    ];
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();
    for (word, n) in WORDS {
        if word.contains(' ') {
            if lower.contains(word) {
                return n;
            }
        } else if words.contains(&word) {
            return n;
        }
    }
    if lower.contains('两') {
        return 2;
    }
    1
}
