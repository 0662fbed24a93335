//! Minimal `*`/`?` wildcard matching for `TypeRule::key_pattern`
//! (`spec.md` §3: "Glob pattern matched against the document key").

/// True if `text` matches `pattern`, where `*` matches any run of
/// characters (including none) and `?` matches exactly one character.
pub fn matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches_from(&pattern, &text)
}

fn matches_from(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            matches_from(&pattern[1..], text)
                || (!text.is_empty() && matches_from(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && matches_from(&pattern[1..], &text[1..]),
        Some(c) => text.first() == Some(c) && matches_from(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_suffix() {
        assert!(matches("user::*", "user::42"));
        assert!(matches("user::*", "user::"));
        assert!(!matches("user::*", "order::42"));
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        assert!(matches("doc-?", "doc-1"));
        assert!(!matches("doc-?", "doc-12"));
    }

    #[test]
    fn bare_star_matches_everything() {
        assert!(matches("*", ""));
        assert!(matches("*", "anything at all"));
    }

    #[test]
    fn literal_pattern_requires_exact_match() {
        assert!(matches("exact", "exact"));
        assert!(!matches("exact", "exactly"));
    }
}
