//! 商品消歧：把用户措辞解析到候选列表中的某一个商品
//!
//! 规则（确定性）：
//! 1. 序数词（first / 2nd / last / 第二个）直接按位置选取
//! 2. 否则对每个候选打分：内容词命中名称记 3 分，仅命中描述记 1 分；取最高分，
//!    同分时检索排名靠前者胜出
//! 3. 措辞有信息量但所有候选得分为 0 时报「找不到」，绝不默认取第一个
//! 4. 措辞无信息量（「买这个」）时只有唯一候选才选中，多个候选需要追问

use std::collections::HashSet;

use crate::core::AgentError;
use crate::memory::tokenizer::{content_tokens, tokenize_to_set};
use crate::merchant::{Product, ProductId};

const NAME_WEIGHT: usize = 3;
const DESCRIPTION_WEIGHT: usize = 1;

/// 数量、序数等不参与商品匹配的词
const NON_PRODUCT_TERMS: &[&str] = &[
    "first", "1st", "second", "2nd", "third", "3rd", "fourth", "4th", "fifth", "5th", "last",
    "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "couple", "them",
    "those", "here", "there", "now", "too", "also", "just", "ll", "take", "have", "grab",
    "remove", "delete", "drop", "out", "from", "change", "update", "set", "make", "reduce",
    "decrease", "increase", "lower", "raise", "quantity", "basket", "bag", "instead",
    "两个", "一个", "几个", "第一", "第二", "第三", "最后", "删除", "移除", "去掉", "拿掉",
    "改成", "改为", "购物车", "不要",
];

/// 消歧结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Selected(ProductId),
    /// 多个候选且措辞无法区分
    Ambiguous,
}

/// 序数词 -> 候选下标
fn ordinal_index(text: &str, len: usize) -> Option<Option<usize>> {
    const ORDINALS: [(&[&str], usize); 5] = [
        (&["first", "1st", "第一"], 0),
        (&["second", "2nd", "第二"], 1),
        (&["third", "3rd", "第三"], 2),
        (&["fourth", "4th", "第四"], 3),
        (&["fifth", "5th", "第五"], 4),
    ];
    let lower = text.to_lowercase();
    let words: HashSet<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |w: &str| {
        if w.is_ascii() {
            words.contains(w)
        } else {
            lower.contains(w)
        }
    };

    if has("last") || has("最后") {
        return Some(len.checked_sub(1));
    }
    ORDINALS
        .iter()
        .find(|(names, _)| names.iter().any(|n| has(n)))
        .map(|(_, idx)| (*idx < len).then_some(*idx))
}

/// 用户措辞中用于匹配商品的内容词（去重、保序）
pub fn product_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content_tokens(text)
        .into_iter()
        .filter(|t| !NON_PRODUCT_TERMS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn score(terms: &[String], product: &Product) -> usize {
    let name = tokenize_to_set(&product.name);
    let description = tokenize_to_set(&product.description);
    terms
        .iter()
        .map(|t| {
            if name.contains(t) {
                NAME_WEIGHT
            } else if description.contains(t) {
                DESCRIPTION_WEIGHT
            } else {
                0
            }
        })
        .sum()
}

/// 在按检索排名排列的候选中选出用户所指的商品
pub fn select_product(text: &str, candidates: &[Product]) -> Result<Selection, AgentError> {
    if let Some(position) = ordinal_index(text, candidates.len()) {
        return match position {
            Some(i) => Ok(Selection::Selected(candidates[i].id.clone())),
            None => Err(AgentError::ProductNotFound(text.to_string())),
        };
    }

    let terms = product_terms(text);
    if terms.is_empty() {
        return match candidates {
            [] => Err(AgentError::ProductNotFound(text.to_string())),
            [only] => Ok(Selection::Selected(only.id.clone())),
            _ => Ok(Selection::Ambiguous),
        };
    }

    let mut best: Option<(usize, &Product)> = None;
    for candidate in candidates {
        let s = score(&terms, candidate);
        tracing::trace!(product_id = %candidate.id, score = s, "candidate scored");
        // 严格大于：同分保留排名靠前者
        if s > 0 && best.map_or(true, |(b, _)| s > b) {
            best = Some((s, candidate));
        }
    }

    best.map(|(_, p)| Selection::Selected(p.id.clone()))
        .ok_or_else(|| AgentError::ProductNotFound(text.to_string()))
}
