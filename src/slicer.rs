//! Passage extraction: given a page body and a query, find the shortest
//! coherent quote that best answers the query. Pure functions — same
//! inputs always produce the same `(quote, score)`.

use std::collections::HashSet;

use serde::Serialize;

pub const DEFAULT_MAX_WORDS: usize = 40;
const MIN_WORDS: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Passage {
    pub quote: String,
    pub score: f32,
    pub word_count: usize,
    pub char_count: usize,
}

fn tokenize_words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// Split on `.`/`!`/`?` followed by whitespace. Not a full sentence
/// segmenter, but matches the boundary rule the upstream service uses.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'.' || c == b'!' || c == b'?' {
            let mut j = i + 1;
            if j < bytes.len() && (bytes[j] as char).is_whitespace() {
                while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                sentences.push(text[start..i + 1].trim());
                start = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    if start < text.len() {
        let tail = text[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail);
        }
    }
    sentences.into_iter().filter(|s| !s.is_empty()).collect()
}

fn normalize_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|w| !w.is_empty())
        .collect()
}

fn strip_punct_lower(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect()
}

/// Ratcliff/Obershelp-style similarity ratio: `2*M / (len(a) + len(b))`
/// where `M` is the total length of matching blocks found via a greedy
/// longest-common-substring recursion, the same definition
/// `difflib.SequenceMatcher.ratio()` uses.
fn sequence_similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let matches = matching_chars(&a, &b);
    (2.0 * matches as f32) / (a.len() + b.len()) as f32
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (best_len, a_start, b_start) = longest_common_substring(a, b);
    if best_len == 0 {
        return 0;
    }
    matching_chars(&a[..a_start], &b[..b_start])
        + best_len
        + matching_chars(&a[a_start + best_len..], &b[b_start + best_len..])
}

fn longest_common_substring(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut dp = vec![0usize; b.len() + 1];
    let mut best_len = 0;
    let mut best_a_end = 0;
    let mut best_b_end = 0;
    for i in 0..a.len() {
        let mut prev_diag = 0;
        for j in 0..b.len() {
            let current = dp[j + 1];
            dp[j + 1] = if a[i] == b[j] { prev_diag + 1 } else { 0 };
            if dp[j + 1] > best_len {
                best_len = dp[j + 1];
                best_a_end = i + 1;
                best_b_end = j + 1;
            }
            prev_diag = current;
        }
    }
    (best_len, best_a_end - best_len, best_b_end - best_len)
}

/// Find the sentence (or small context window) of `body` most relevant to
/// `query`, truncated to `max_words` tokens. Returns `None` when no
/// sentence shares any token with `query` — the caller falls back to the
/// first `max_words` tokens of the whole `body` in that case.
pub fn best_quote(query: &str, body: &str, max_words: usize) -> Option<String> {
    if body.is_empty() {
        return Some(String::new());
    }

    let sentences = split_sentences(body);
    if sentences.len() <= 1 {
        let words = tokenize_words(body);
        return Some(words[..words.len().min(max_words)].join(" "));
    }

    let query_tokens = normalize_tokens(query);
    if query_tokens.is_empty() {
        let words = tokenize_words(sentences[0]);
        return Some(words[..words.len().min(max_words)].join(" "));
    }

    let query_clean = strip_punct_lower(query);

    let mut scored: Vec<(usize, f32)> = Vec::new();
    for (idx, sentence) in sentences.iter().enumerate() {
        let sentence_tokens = normalize_tokens(sentence);
        let common = query_tokens.intersection(&sentence_tokens).count();
        if common == 0 {
            continue;
        }
        let token_overlap = common as f32 / query_tokens.len() as f32;
        let sentence_clean = strip_punct_lower(sentence);
        let sequence_sim = sequence_similarity(&query_clean, &sentence_clean);
        let combined = 0.7 * token_overlap + 0.3 * sequence_sim;
        scored.push((idx, combined));
    }

    if scored.is_empty() {
        return None;
    }

    // Highest score wins; ties broken by earliest occurrence (lower idx).
    scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap() {
        std::cmp::Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });
    let (best_idx, _) = scored[0];
    let best_sentence = sentences[best_idx];

    let best_word_count = tokenize_words(best_sentence).len();
    if (best_word_count as f32) < (max_words as f32 / 2.0) {
        let start = best_idx.saturating_sub(1);
        let end = (best_idx + 2).min(sentences.len());
        let context = sentences[start..end].join(" ");
        let words = tokenize_words(&context);
        return Some(words[..words.len().min(max_words)].join(" "));
    }

    let words = tokenize_words(best_sentence);
    Some(words[..words.len().min(max_words)].join(" "))
}

/// `Extract(body, query)` from the component design: returns the best
/// passage with a relevance score, word count and char count.
pub fn extract(body: &str, query: &str, max_words: usize) -> Passage {
    if body.is_empty() {
        return Passage { quote: String::new(), score: 0.0, word_count: 0, char_count: 0 };
    }

    let Some(quote) = best_quote(query, body, max_words) else {
        // No sentence shared a token with the query: fall back to the first
        // max_words tokens of the whole body, fixed score 0.1.
        let words = tokenize_words(body);
        let fallback_words = &words[..words.len().min(max_words)];
        let fallback = fallback_words.join(" ");
        return Passage {
            word_count: fallback_words.len(),
            char_count: fallback.chars().count(),
            quote: fallback,
            score: 0.1,
        };
    };

    let query_tokens = normalize_tokens(query);
    let quote_tokens = normalize_tokens(&quote);
    let score = if query_tokens.is_empty() {
        0.1
    } else {
        let common = query_tokens.intersection(&quote_tokens).count();
        common as f32 / query_tokens.len() as f32
    };

    if quote.is_empty() {
        let words = tokenize_words(body);
        let fallback_words = &words[..words.len().min(max_words)];
        let fallback = fallback_words.join(" ");
        return Passage {
            word_count: fallback_words.len(),
            char_count: fallback.chars().count(),
            quote: fallback,
            score: 0.1,
        };
    }

    Passage {
        word_count: tokenize_words(&quote).len(),
        char_count: quote.chars().count(),
        quote,
        score,
    }
}

/// Minimum plausible passage length; exposed for callers that want to
/// distinguish a "thin" match from a substantive one.
pub fn is_substantive(passage: &Passage) -> bool {
    passage.word_count >= MIN_WORDS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purity_same_inputs_same_output() {
        let body = "Alpha. Beta cat. Gamma delta cat.";
        let a = extract(body, "cat", DEFAULT_MAX_WORDS);
        let b = extract(body, "cat", DEFAULT_MAX_WORDS);
        assert_eq!(a, b);
    }

    #[test]
    fn finds_sentence_containing_query_term() {
        let body = "Alpha. Beta cat. Gamma delta cat.";
        let passage = extract(body, "cat", DEFAULT_MAX_WORDS);
        assert!(passage.quote.to_lowercase().contains("cat"));
        assert!(passage.score > 0.0);
    }

    #[test]
    fn empty_body_yields_empty_quote_and_zero_score() {
        let passage = extract("", "anything", DEFAULT_MAX_WORDS);
        assert_eq!(passage.quote, "");
        assert_eq!(passage.score, 0.0);
    }

    #[test]
    fn no_sentence_overlap_falls_back_to_whole_body_with_fixed_score() {
        let body = "Alpha beta. Gamma delta.";
        let passage = extract(body, "zzz", DEFAULT_MAX_WORDS);
        assert_eq!(passage.quote, "Alpha beta. Gamma delta.");
        assert_eq!(passage.score, 0.1);
    }

    #[test]
    fn short_text_returns_truncated_body() {
        let body = "just a handful of words here";
        let passage = extract(body, "words", DEFAULT_MAX_WORDS);
        assert!(!passage.quote.is_empty());
    }

    #[test]
    fn truncates_to_max_words() {
        let long_sentence = (0..100).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let body = format!("{long_sentence} cat.");
        let passage = extract(&body, "cat", 10);
        assert!(passage.word_count <= 10);
    }

    #[test]
    fn split_sentences_handles_basic_punctuation() {
        let sentences = split_sentences("One. Two! Three?");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?"]);
    }
}
