//! Text normalization for the per-word index: strip URLs and punctuation,
//! lowercase, tokenize, and stem each token with a language-aware stemmer.

use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use tracing::trace;

pub const CRATE_NAME: &str = "tgstat-nlp";

/// Normalizes raw message text into a space-joined token sequence.
///
/// Constructed once and passed by reference to every caller that needs
/// normalization; there is no hidden process-wide instance. `normalize` is
/// total: any input string yields a (possibly empty) output string.
pub struct TextNormalizer {
    url_pattern: Regex,
    punct_pattern: Regex,
    whitespace_pattern: Regex,
    russian: Stemmer,
    english: Stemmer,
}

impl TextNormalizer {
    pub fn new() -> Self {
        // The regexes are literals; a failure here is a programmer error,
        // not a runtime condition.
        Self {
            url_pattern: Regex::new(r"(?:https?://|www\.)\S+|http\S+").expect("url pattern"),
            punct_pattern: Regex::new(r#"[-*?()"'+;.,:`<>#\[\]%]+|[?!]+$"#)
                .expect("punct pattern"),
            whitespace_pattern: Regex::new(r"\s+").expect("whitespace pattern"),
            russian: Stemmer::create(Algorithm::Russian),
            english: Stemmer::create(Algorithm::English),
        }
    }

    /// Strip URLs and punctuation, collapse whitespace, lowercase, then stem
    /// each token. Tokens that normalize to empty are dropped; a token the
    /// stemmer leaves untouched is kept as-is.
    pub fn normalize(&self, raw_text: &str) -> String {
        let stripped = self.url_pattern.replace_all(raw_text, "");
        let stripped = self.punct_pattern.replace_all(&stripped, " ");
        let collapsed = self.whitespace_pattern.replace_all(&stripped, " ");
        let lowered = collapsed.trim().to_lowercase();

        let mut tokens = Vec::new();
        for token in lowered.split_whitespace() {
            let stemmed = self.normalize_token(token);
            if !stemmed.is_empty() {
                tokens.push(stemmed);
            }
        }
        tokens.join(" ")
    }

    fn normalize_token(&self, token: &str) -> String {
        let stemmer = if token.chars().any(is_cyrillic) {
            &self.russian
        } else {
            &self.english
        };
        let stemmed = stemmer.stem(token);
        if stemmed.is_empty() {
            trace!(token, "token stemmed to empty, dropping");
        }
        stemmed.into_owned()
    }
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_cyrillic(c: char) -> bool {
    ('\u{0400}'..='\u{04FF}').contains(&c)
}

/// Hashtag-like whitespace tokens of the RAW text (tokens starting with `#`).
pub fn extract_hashtags(raw_text: &str) -> Vec<String> {
    raw_text
        .split_whitespace()
        .filter(|token| token.starts_with('#'))
        .map(str::to_string)
        .collect()
}
