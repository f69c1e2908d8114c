//! 分词模块
//!
//! 提供中英文混合分词能力，用于关键词兜底检索与商品消歧。
//! 使用 jieba-rs 进行中文分词，英文按非字母数字字符切分。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 对消歧与检索没有信息量的词
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "i", "me", "my", "we", "you", "it", "this", "that", "these", "those",
    "one", "ones", "please", "want", "would", "like", "to", "buy", "get", "purchase", "order",
    "add", "find", "search", "show", "look", "looking", "for", "some", "any", "of", "and", "or",
    "with", "in", "on", "can", "could", "do", "does", "is", "are", "be", "have", "has", "need",
    "cart", "into", "item", "items", "product", "products", "thing", "x",
    "我", "要", "想", "买", "购买", "一个", "这个", "那个", "请", "帮", "帮我", "的", "了",
];

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Unified Ideographs Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 智能分词：根据文本内容自动选择分词策略
/// - 包含 CJK 字符时使用 jieba 分词
/// - 纯英文时按非字母数字字符切分
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .filter(|s| s.chars().count() > 1 || s.chars().next().map(is_cjk).unwrap_or(false))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .map(|s| s.to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// 去掉停用词与单字符英文词，并做单复数归一化
pub fn content_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .filter(|t| contains_cjk(t) || t.chars().count() > 1)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .map(|t| normalize_term(&t))
        .collect()
}

/// 英文单复数归一化（cables -> cable, boxes -> box）；CJK 原样返回
pub fn normalize_term(term: &str) -> String {
    if contains_cjk(term) || term.chars().count() <= 3 {
        return term.to_string();
    }
    if let Some(stem) = term.strip_suffix("ies") {
        return format!("{stem}y");
    }
    if let Some(stem) = term.strip_suffix("es") {
        if stem.ends_with('x') || stem.ends_with("ch") || stem.ends_with("sh") {
            return stem.to_string();
        }
    }
    match term.strip_suffix('s') {
        Some(stem) if !stem.ends_with('s') => stem.to_string(),
        _ => term.to_string(),
    }
}

/// 分词并返回归一化后的词集合（用于相似度计算）
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).iter().map(|t| normalize_term(t)).collect()
}

/// 计算两个词集合的重叠分数（交集大小）
pub fn overlap_score(set1: &HashSet<String>, set2: &HashSet<String>) -> usize {
    set1.intersection(set2).count()
}
