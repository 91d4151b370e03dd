//! This module provides [parse_words], which turns the free-text keyword list returned by the image analysis
//! service into the clean, ordered word list stored with each image, and [filter_words], which applies the same
//! rules to an existing list.

use {lazy_static::lazy_static, regex::Regex, std::collections::HashSet};

/// Words longer than this are almost certainly sentences rather than keywords.
const MAX_WORD_LENGTH: usize = 50;

/// Phrases the analysis service uses to say it found nothing, which are useless as search terms
const META_PHRASES: &[&str] = &[
    "no text",
    "not visible",
    "not readable",
    "cannot read",
    "no visible",
    "n/a",
    "nothing",
    "text not",
    "unreadable",
    "illegible",
];

lazy_static! {
    static ref MARKDOWN: Regex = Regex::new(r"[*_`]").unwrap();
    static ref PARENTHETICAL: Regex = Regex::new(r"\([^)]*\)").unwrap();
    static ref SEPARATOR: Regex = Regex::new(r"[,\n]+").unwrap();
    static ref ALLOWED: Regex = Regex::new(r"^[a-zA-Z0-9 \-']+$").unwrap();
}

fn strip(text: &str) -> String {
    PARENTHETICAL
        .replace_all(&MARKDOWN.replace_all(text, ""), "")
        .into_owned()
}

fn keep(word: &str) -> bool {
    !word.is_empty()
        && word.len() <= MAX_WORD_LENGTH
        && ALLOWED.is_match(word)
        && !META_PHRASES.iter().any(|phrase| word.contains(phrase))
        && (word.chars().count() > 1 || word == "a" || word == "i")
}

/// Clean up a list of candidate words, preserving the order in which each word first appears.
///
/// Each candidate is lower-cased and trimmed, then dropped if it is empty, a duplicate, too long, contains anything
/// but ASCII letters, digits, spaces, hyphens, and apostrophes, contains a "nothing found" phrase, or is a single
/// character other than "a" or "i".
pub fn filter_words<S: AsRef<str>>(candidates: impl IntoIterator<Item = S>) -> Vec<String> {
    let mut seen = HashSet::new();

    candidates
        .into_iter()
        .filter_map(|candidate| {
            let word = strip(candidate.as_ref()).trim().to_lowercase();

            if keep(&word) && seen.insert(word.clone()) {
                Some(word)
            } else {
                None
            }
        })
        .collect()
}

/// Parse the comma- or newline-separated keyword text returned by the analysis service.
pub fn parse_words(text: &str) -> Vec<String> {
    let text = strip(text.trim());

    filter_words(SEPARATOR.split(&text))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(
            parse_words("Mountain, *Sunset*, (no text visible), café, x, a"),
            vec!["mountain", "sunset", "a"]
        );

        assert_eq!(
            parse_words("  `Orange Sky`\nPeaceful,,landscape\n\nsnow peak, I, orange sky  "),
            vec!["orange sky", "peaceful", "landscape", "snow peak", "i"]
        );

        assert_eq!(
            parse_words("text: none, No visible text, N/A, nothing legible, rock'n'roll, T-shirt"),
            vec!["rock'n'roll", "t-shirt"]
        );

        assert!(parse_words("").is_empty());
        assert!(parse_words("\n , \n").is_empty());
    }

    #[test]
    fn parentheticals_may_span_separators() {
        assert_eq!(
            parse_words("beach (sand, waves), palm tree"),
            vec!["beach", "palm tree"]
        );
    }

    #[test]
    fn long_words() {
        let long = "a".repeat(MAX_WORD_LENGTH + 1);
        let limit = "b".repeat(MAX_WORD_LENGTH);

        assert_eq!(
            parse_words(&format!("{}, {}, ok", long, limit)),
            vec![limit.as_str(), "ok"]
        );
    }

    #[test]
    fn filter_existing() {
        assert_eq!(
            filter_words(&["Sunset", "sunset", "日本語", "not readable text", "ocean"]),
            vec!["sunset", "ocean"]
        );

        let clean = vec!["mountain".to_owned(), "lake".to_owned()];

        assert_eq!(filter_words(&clean), clean);
    }
}
