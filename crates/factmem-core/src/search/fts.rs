//! FTS5 query construction from free-text user input.

use std::collections::HashSet;
use std::sync::LazyLock;

static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "the", "and", "or", "but", "is", "are", "was", "were", "in", "on", "at", "to", "for", "of", "with",
        "by", "from", "it", "its", "this", "that", "these", "those", "i", "me", "my", "we", "our", "you", "your",
        "he", "she", "his", "her", "they", "them", "their", "do", "does", "did", "has", "have", "had", "be", "been",
        "being", "will", "would", "could", "should", "not", "no", "so", "if", "how", "what", "when", "where", "who",
        "which",
    ]
    .into_iter()
    .collect()
});

/// Builds an FTS5 `OR`-joined, quoted query from free text, filtering
/// stopwords and single-character tokens. Falls back to the unfiltered
/// token list if stopword removal would leave nothing, and returns
/// `None` if there is still nothing meaningful to search for.
pub fn build_fts_query(query: &str) -> Option<String> {
    let terms: Vec<&str> = query.split_whitespace().collect();

    let mut meaningful: Vec<&str> =
        terms.iter().copied().filter(|t| !STOPWORDS.contains(t.to_lowercase().as_str()) && t.chars().count() > 1).collect();

    if meaningful.is_empty() {
        meaningful = terms.iter().copied().filter(|t| t.chars().count() > 1).collect();
    }

    if meaningful.is_empty() {
        return None;
    }

    let quoted: Vec<String> = meaningful.iter().map(|t| format!("\"{}\"", t.replace('"', "\"\""))).collect();
    Some(quoted.join(" OR "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_stopwords() {
        let q = build_fts_query("what is the capital of France").unwrap();
        assert!(q.contains("\"capital\""));
        assert!(q.contains("\"France\""));
        assert!(!q.contains("\"what\""));
    }

    #[test]
    fn falls_back_to_unfiltered_when_all_stopwords() {
        let q = build_fts_query("what is this").unwrap();
        assert!(q.contains("\"what\""));
    }

    #[test]
    fn returns_none_for_only_single_char_tokens() {
        assert!(build_fts_query("a i").is_none());
    }

    #[test]
    fn escapes_embedded_quotes() {
        let q = build_fts_query("say \"hello\" world").unwrap();
        assert!(q.contains("\"\"\"\"") || q.contains("hello"));
    }
}
