use serde::{Deserialize, Serialize};

use crate::tokenize::tokenize;

/// One element of a free text query. Elements of a query are ANDed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextQuery {
    /// Matches on the stem, or on any term starting with `word` when
    /// `prefix` is set.
    Term { word: String, prefix: bool },
    /// Consecutive words. Stemmed phrases compare stems.
    Phrase { words: Vec<String>, stemmed: bool },
    /// `a` and `b` no more than `within` positions apart, either order.
    Near { a: String, b: String, within: u32 },
}

impl TextQuery {
    pub fn term(word: &str) -> Self {
        TextQuery::Term { word: word.to_lowercase(), prefix: false }
    }

    /// Parse user syntax: bare words, `word*`, `"exact phrase"`,
    /// `~"stemmed phrase"` and `a /3 b`.
    pub fn parse(input: &str) -> Vec<TextQuery> {
        let mut out: Vec<TextQuery> = Vec::new();
        let mut rest = input;
        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }
            let (stemmed, body) = match rest.strip_prefix("~\"") {
                Some(b) => (true, Some(b)),
                None => (false, rest.strip_prefix('"')),
            };
            if let Some(body) = body {
                let (inner, after) = match body.find('"') {
                    Some(i) => (&body[..i], &body[i + 1..]),
                    None => (body, ""),
                };
                let words = tokenize(inner);
                match words.len() {
                    0 => {}
                    1 => out.push(TextQuery::Term { word: words[0].clone(), prefix: false }),
                    _ => out.push(TextQuery::Phrase { words, stemmed }),
                }
                rest = after;
                continue;
            }
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let token = &rest[..end];
            rest = &rest[end..];
            if let Some(n) = token.strip_prefix('/').and_then(|n| n.parse::<u32>().ok()) {
                if let Some(TextQuery::Term { word: a, .. }) = out.last().cloned() {
                    let next = rest.trim_start();
                    let next_end = next.find(char::is_whitespace).unwrap_or(next.len());
                    if let Some(b) = tokenize(&next[..next_end]).into_iter().next() {
                        out.pop();
                        out.push(TextQuery::Near { a, b, within: n.max(1) });
                        rest = &next[next_end..];
                    }
                }
                continue;
            }
            let prefix = token.ends_with('*');
            let words = tokenize(token);
            let last = words.len().saturating_sub(1);
            for (i, word) in words.into_iter().enumerate() {
                out.push(TextQuery::Term { word, prefix: prefix && i == last });
            }
        }
        out
    }

    /// Words to highlight in results. Empty queries cannot be ranked.
    pub fn highlight_words(&self) -> Vec<&str> {
        match self {
            TextQuery::Term { word, .. } => vec![word.as_str()],
            TextQuery::Phrase { words, .. } => words.iter().map(String::as_str).collect(),
            TextQuery::Near { a, b, .. } => vec![a.as_str(), b.as_str()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_syntax() {
        let q = TextQuery::parse(r#"Annual "board meeting" ~"signed contracts" cont* alpha /3 beta"#);
        assert_eq!(
            q,
            vec![
                TextQuery::term("annual"),
                TextQuery::Phrase { words: vec!["board".into(), "meeting".into()], stemmed: false },
                TextQuery::Phrase { words: vec!["signed".into(), "contracts".into()], stemmed: true },
                TextQuery::Term { word: "cont".into(), prefix: true },
                TextQuery::Near { a: "alpha".into(), b: "beta".into(), within: 3 },
            ]
        );
    }

    #[test]
    fn lenient_on_odd_input() {
        assert_eq!(TextQuery::parse(r#""unterminated"#), vec![TextQuery::term("unterminated")]);
        assert_eq!(TextQuery::parse("/2 x"), vec![TextQuery::term("x")]);
        assert!(TextQuery::parse("  ").is_empty());
    }
}
