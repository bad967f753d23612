//! Search tokens for message history.
//!
//! Text is segmented with jieba in search mode, which emits overlapping
//! sub-words for long CJK words and passes Latin words through whole.

use std::collections::HashSet;

use jieba_rs::Jieba;

/// CJK-aware segmenter. Loading the dictionary is slow, so build one and share it.
pub struct Tokenizer {
    jieba: Jieba,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self { jieba: Jieba::new() }
    }

    /// Raw segments, in order, including whitespace and punctuation.
    pub fn segment<'a>(&self, text: &'a str) -> Vec<&'a str> {
        self.jieba.cut_for_search(text, true)
    }

    /// Segment and normalize into search tokens.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        trim_tokens(self.segment(text))
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize raw segments into unique search tokens.
///
/// Each segment is trimmed; segments of at most one byte are dropped unless
/// alphabetic (so `a` or `I` survive, `,` does not); duplicates are removed
/// keeping the first occurrence.
pub fn trim_tokens<I, S>(segments: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for segment in segments {
        let token = segment.as_ref().trim();
        if token.len() <= 1 && !is_alpha(token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            out.push(token.to_string());
        }
    }

    out
}

fn is_alpha(s: &str) -> bool {
    !s.is_empty() && s.chars().all(char::is_alphabetic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert!(trim_tokens(Vec::<&str>::new()).is_empty());
        assert!(trim_tokens(["", " ", "\n"]).is_empty());
    }

    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let tokens = trim_tokens(["cat", "dog", "cat", "bird", "dog"]);
        assert_eq!(tokens, vec!["cat", "dog", "bird"]);
    }

    #[test]
    fn test_single_byte_filter() {
        let tokens = trim_tokens(["a", ",", "I", "!", "7", " ", "ok"]);
        assert_eq!(tokens, vec!["a", "I", "ok"]);
    }

    #[test]
    fn test_multibyte_single_char_kept() {
        // One CJK character is three bytes in UTF-8
        let tokens = trim_tokens(["猫", "。", "的"]);
        assert_eq!(tokens, vec!["猫", "。", "的"]);
    }

    #[test]
    fn test_trims_before_comparing() {
        let tokens = trim_tokens([" rust ", "rust", "\trust"]);
        assert_eq!(tokens, vec!["rust"]);
    }

    #[test]
    fn test_tokenizer_mixed_text() {
        let tokenizer = Tokenizer::new();
        let tokens = tokenizer.tokens("hello, world! hello 世界");
        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"world".to_string()));
        assert!(tokens.contains(&"世界".to_string()));
        assert!(!tokens.contains(&",".to_string()));
        assert_eq!(tokens.iter().filter(|t| *t == "hello").count(), 1);
    }

    #[test]
    fn test_tokenizer_search_mode_subwords() {
        let tokenizer = Tokenizer::new();
        let tokens = tokenizer.tokens("中华人民共和国");
        assert!(tokens.contains(&"中华".to_string()));
        assert!(tokens.contains(&"中华人民共和国".to_string()));
    }
}
