use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const ARTICLES: [&str; 3] = ["a", "an", "the"];

#[must_use]
pub fn is_article(word: &str) -> bool {
    ARTICLES.iter().any(|article| article.eq_ignore_ascii_case(word))
}

/// Split message text into word tokens.
///
/// Words are separated by Unicode whitespace. A word that follows an article is
/// joined onto it with a single space, unless the word is a single character, so
/// "the cat" is one token while "plan a b" keeps `b` standalone. No token is empty.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    tokenize_into(&mut tokens, text);
    tokens
}

/// Append the tokens of `text` to `dst`, reusing its allocation.
pub fn tokenize_into(dst: &mut Vec<String>, text: &str) {
    let start = dst.len();
    let mut join = false;
    for word in text.split_whitespace() {
        let single = word.chars().nth(1).is_none();
        let merged = join && !single && dst.len() > start;
        join = is_article(word);
        if merged {
            if let Some(last) = dst.last_mut() {
                last.push(' ');
                last.push_str(word);
                continue;
            }
        }
        dst.push(word.to_string());
    }
}

/// Map a token to the canonical form used for matching prefixes.
///
/// The token is compatibility-decomposed, stripped of combining marks, lowercased
/// and recomposed, so "Café", "CAFE" and "café" all reduce to "cafe". A token
/// made only of combining marks reduces to itself; a non-empty token never
/// reduces to the empty padding term.
#[must_use]
pub fn reduce(token: &str) -> String {
    let lowered: String = token
        .nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .flat_map(char::to_lowercase)
        .collect();
    if lowered.is_empty() {
        return token.to_string();
    }
    lowered.nfc().collect()
}
