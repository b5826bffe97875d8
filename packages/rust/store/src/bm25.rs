//! Okapi BM25 scoring over tokenized documents.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use webrag_shared::RetrievalConfig;

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Document-length normalisation, 0 (none) to 1 (full).
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

impl From<&RetrievalConfig> for Bm25Params {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            k1: config.k1,
            b: config.b,
        }
    }
}

/// Split text into lowercase terms of two or more word characters.
pub fn tokenize(text: &str) -> Vec<String> {
    static TOKEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?u)\b\w\w+\b").expect("valid regex"));
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Term statistics for one stored document.
#[derive(Debug, Clone, Default)]
pub(crate) struct TermStats {
    pub freqs: HashMap<String, u32>,
    pub len: usize,
}

impl TermStats {
    pub fn of(text: &str) -> Self {
        let tokens = tokenize(text);
        let mut freqs = HashMap::new();
        for token in &tokens {
            *freqs.entry(token.clone()).or_insert(0) += 1;
        }
        Self {
            freqs,
            len: tokens.len(),
        }
    }
}

/// Score every document in `corpus` against `query`, in corpus order.
pub(crate) fn score_all(query: &str, corpus: &[&TermStats], params: Bm25Params) -> Vec<f64> {
    let n = corpus.len();
    if n == 0 {
        return Vec::new();
    }

    let total_len: usize = corpus.iter().map(|s| s.len).sum();
    let avgdl = if total_len == 0 {
        1.0
    } else {
        total_len as f64 / n as f64
    };

    let query_terms = tokenize(query);
    let idf: HashMap<&str, f64> = query_terms
        .iter()
        .map(|term| {
            let df = corpus
                .iter()
                .filter(|s| s.freqs.contains_key(term))
                .count() as f64;
            let idf = ((n as f64 - df + 0.5) / (df + 0.5) + 1.0).ln();
            (term.as_str(), idf)
        })
        .collect();

    corpus
        .iter()
        .map(|stats| {
            let norm = params.k1 * (1.0 - params.b + params.b * stats.len as f64 / avgdl);
            query_terms
                .iter()
                .map(|term| {
                    let tf = f64::from(stats.freqs.get(term).copied().unwrap_or(0));
                    if tf == 0.0 {
                        return 0.0;
                    }
                    idf[term.as_str()] * tf * (params.k1 + 1.0) / (tf + norm)
                })
                .sum()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_lowercases_and_drops_short_tokens() {
        assert_eq!(
            tokenize("Functionalities of Sambanova API? a b"),
            vec!["functionalities", "of", "sambanova", "api"]
        );
        assert_eq!(tokenize("Function-Calling"), vec!["function", "calling"]);
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn matching_document_outscores_others() {
        let a = TermStats::of("rust borrow checker");
        let b = TermStats::of("python garbage collector");
        let scores = score_all("borrow checker", &[&a, &b], Bm25Params::default());
        assert!(scores[0] > 0.0);
        assert_eq!(scores[1], 0.0);
    }

    #[test]
    fn repeated_terms_saturate() {
        let once = TermStats::of("cache miss");
        let many = TermStats::of("cache cache cache cache miss");
        let other = TermStats::of("unrelated words here");
        let scores = score_all("cache", &[&once, &many, &other], Bm25Params::default());
        assert!(scores[1] > scores[0]);
        assert!(scores[1] < scores[0] * 4.0);
    }

    #[test]
    fn all_empty_documents_score_zero() {
        let empty = TermStats::of("");
        let scores = score_all("anything", &[&empty, &empty], Bm25Params::default());
        assert_eq!(scores, vec![0.0, 0.0]);
    }
}
