//! Keyword derivation for item search.
//!
//! Latin text splits on non-alphanumerics. Chinese goes through jieba;
//! Japanese/Korean falls back to bigrams, which jieba doesn't segment.

use std::collections::HashSet;
use std::sync::OnceLock;

pub(crate) fn jieba() -> &'static jieba_rs::Jieba {
    static INSTANCE: OnceLock<jieba_rs::Jieba> = OnceLock::new();
    INSTANCE.get_or_init(jieba_rs::Jieba::new)
}

const STOP_WORDS: &[&str] = &[
    "a", "about", "am", "an", "and", "any", "are", "as", "at", "be", "been", "but", "by", "can",
    "did", "do", "does", "for", "from", "had", "has", "have", "he", "her", "his", "how", "i", "in",
    "is", "it", "its", "me", "my", "of", "on", "or", "our", "she", "so", "that", "the", "their",
    "them", "they", "this", "to", "was", "we", "were", "what", "when", "where", "which", "who",
    "why", "will", "with", "you", "your",
];

pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'   // CJK Unified Basic
        | '\u{3400}'..='\u{4DBF}' // CJK Extension A
        | '\u{F900}'..='\u{FAFF}' // CJK Compatibility
        | '\u{3040}'..='\u{30FF}' // Hiragana + Katakana
        | '\u{AC00}'..='\u{D7AF}' // Hangul
    )
}

fn is_cjk_ideograph(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}'
    )
}

fn tokenize(text: &str, keep_stop_words: bool) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |t: String| {
        if seen.insert(t.clone()) {
            out.push(t);
        }
    };

    for word in lower.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if word.is_empty() {
            continue;
        }
        if word.chars().any(is_cjk) {
            for t in segment_cjk(word) {
                push(t);
            }
            // latin runs glued to CJK ("alice是谁")
            let latin: String = word.chars().map(|c| if is_cjk(c) { ' ' } else { c }).collect();
            for w in latin.split_whitespace() {
                if w.chars().count() > 1 && (keep_stop_words || !STOP_WORDS.contains(&w)) {
                    push(w.to_string());
                }
            }
            continue;
        }
        if word.chars().count() < 2 {
            continue;
        }
        if !keep_stop_words && STOP_WORDS.contains(&word) {
            continue;
        }
        push(word.to_string());
    }
    out
}

fn segment_cjk(word: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    if word.chars().any(is_cjk_ideograph) {
        for w in jieba().cut_for_search(word, false) {
            let w = w.trim();
            if w.chars().count() > 1 && w.chars().all(is_cjk) {
                tokens.push(w.to_string());
            }
        }
    }
    let chars: Vec<char> = word.chars().collect();
    let non_ideo = |c: char| is_cjk(c) && !is_cjk_ideograph(c);
    for pair in chars.windows(2) {
        if non_ideo(pair[0]) && non_ideo(pair[1]) {
            tokens.push(pair.iter().collect());
        }
    }
    if tokens.is_empty() {
        // single ideograph words like "茶"
        let run: String = chars.iter().filter(|c| is_cjk(**c)).collect();
        if !run.is_empty() {
            tokens.push(run);
        }
    }
    tokens
}

/// Keywords derived from a natural-language query: stop-words and single
/// characters dropped.
pub fn keywords(query: &str) -> Vec<String> {
    tokenize(query, false)
}

/// Terms of an explicit search query. Stop-words are kept since the caller
/// chose them on purpose; if nothing survives, the trimmed query is the term.
pub fn search_terms(search_query: &str) -> Vec<String> {
    let terms = tokenize(search_query, true);
    if terms.is_empty() && !search_query.trim().is_empty() {
        return vec![search_query.trim().to_lowercase()];
    }
    terms
}

/// Fraction of `terms` contained in `content`.
pub fn relevance(content: &str, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = content.to_lowercase();
    let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
    hits as f64 / terms.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_stop_words() {
        assert_eq!(keywords("What does the user prefer for scripting?"), vec!["user", "prefer", "scripting"]);
    }

    #[test]
    fn explicit_terms_keep_everything() {
        assert_eq!(search_terms("Python"), vec!["python"]);
        assert_eq!(search_terms("the"), vec!["the"]);
        assert_eq!(search_terms("a"), vec!["a"]);
    }

    #[test]
    fn chinese_is_segmented() {
        let kw = keywords("用户喜欢喝咖啡");
        assert!(kw.iter().any(|k| k == "咖啡"), "{kw:?}");
    }

    #[test]
    fn kana_bigrams() {
        let kw = keywords("すし");
        assert_eq!(kw, vec!["すし"]);
    }

    #[test]
    fn relevance_fraction() {
        let terms = vec!["python".to_string(), "rust".to_string()];
        assert!((relevance("User prefers Python", &terms) - 0.5).abs() < 1e-9);
        assert_eq!(relevance("nothing here", &terms), 0.0);
    }
}
