//! 分词与文本相似度
//!
//! 中英文混合分词：含 CJK 字符时走 jieba 搜索引擎模式，否则按非字母数字字符切分。
//! 供短期记忆匹配、语义事实模糊查找与哈希嵌入共用。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

/// 分词：结果全部小写，丢弃单字符的拉丁词（CJK 单字保留）
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
            .filter(|s| s.chars().count() > 1 || s.chars().next().is_some_and(is_cjk))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .map(|s| s.to_lowercase())
            .filter(|s| s.chars().count() > 1)
            .collect()
    }
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// Jaccard 相似度；任一集合为空时为 0
pub fn jaccard_similarity(set1: &HashSet<String>, set2: &HashSet<String>) -> f32 {
    if set1.is_empty() || set2.is_empty() {
        return 0.0;
    }
    let intersection = set1.intersection(set2).count() as f32;
    let union = set1.union(set2).count() as f32;
    intersection / union
}

/// 两段文本的词级 Jaccard 相似度
pub fn text_similarity(a: &str, b: &str) -> f32 {
    jaccard_similarity(&tokenize_to_set(a), &tokenize_to_set(b))
}

/// 语义事实的规范化键：分词后按原顺序以单空格拼接
///
/// "The  Sky is BLUE." 与 "the sky is blue" 得到同一个键。
pub fn normalize_key(text: &str) -> String {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return text.trim().to_lowercase();
    }
    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english() {
        let tokens = tokenize("Deploy the Rust service, then verify logs!");
        assert!(tokens.contains(&"rust".to_string()));
        assert!(tokens.contains(&"logs".to_string()));
        assert!(!tokens.iter().any(|t| t.contains(',')));
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("我喜欢编程和人工智能");
        assert!(tokens.iter().any(|t| t.contains("编程") || t.contains("智能")));
    }

    #[test]
    fn test_text_similarity() {
        assert!(text_similarity("analyze rust crates", "rust crates analysis") > 0.0);
        assert_eq!(text_similarity("", "anything"), 0.0);
        assert!((text_similarity("same words here", "same words here") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("The  Sky is BLUE."), normalize_key("the sky is blue"));
        assert_ne!(normalize_key("sky is blue"), normalize_key("sky is red"));
    }
}
