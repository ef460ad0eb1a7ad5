/// Longest term kept in the index.
pub const MAX_TERM_LEN: usize = 64;

/// Lowercased alphanumeric words, in order.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() <= MAX_TERM_LEN)
        .collect()
}

/// A small suffix-stripping stemmer for English. It only has to map
/// inflections of the same word to one key; the keys are never shown.
pub fn stem(word: &str) -> String {
    let w = word.to_lowercase();
    if w.chars().count() <= 3 || !w.is_ascii() {
        return w;
    }
    const RULES: &[(&str, &str)] = &[
        ("ational", "ate"),
        ("ization", "ize"),
        ("fulness", "ful"),
        ("iveness", "ive"),
        ("ments", "ment"),
        ("ings", ""),
        ("sses", "ss"),
        ("ies", "y"),
        ("ing", ""),
        ("edly", ""),
        ("ed", ""),
        ("ly", ""),
        ("s", ""),
    ];
    for (suffix, replacement) in RULES {
        if let Some(base) = w.strip_suffix(suffix) {
            if *suffix == "s" && base.ends_with('s') {
                return w;
            }
            if base.len() < 3 {
                continue;
            }
            let mut out = format!("{}{}", base, replacement);
            if replacement.is_empty() {
                undouble(&mut out);
            }
            return out;
        }
    }
    w
}

fn undouble(s: &mut String) {
    let b = s.as_bytes();
    let n = b.len();
    if n >= 2 && b[n - 1] == b[n - 2] && !matches!(b[n - 1], b'l' | b's' | b'z') && !b"aeiou".contains(&b[n - 1]) {
        s.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words() {
        assert_eq!(tokenize("Hello, World! x2-y"), vec!["hello", "world", "x2", "y"]);
        assert!(tokenize("  ..  ").is_empty());
    }

    #[test]
    fn stems_share_keys() {
        assert_eq!(stem("contracts"), "contract");
        assert_eq!(stem("Contract"), "contract");
        assert_eq!(stem("running"), "run");
        assert_eq!(stem("companies"), "company");
        assert_eq!(stem("glass"), "glass");
        assert_eq!(stem("cat"), "cat");
    }
}
