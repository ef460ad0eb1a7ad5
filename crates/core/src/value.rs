use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ObjRef;

/// Text subkinds. Identifier kinds carry a typecode which is written into
/// the identifier index so clauses can match on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextKind {
    Plain,
    Paragraph,
    Document,
    PersonName,
    EmailAddress,
    Url,
    Postcode,
    Telephone,
    ConfigurationName,
}

impl TextKind {
    pub fn typecode(&self) -> i64 {
        match self {
            TextKind::Plain => 16,
            TextKind::Paragraph => 17,
            TextKind::Document => 18,
            TextKind::PersonName => 19,
            TextKind::EmailAddress => 27,
            TextKind::Url => 28,
            TextKind::Postcode => 29,
            TextKind::Telephone => 30,
            TextKind::ConfigurationName => 31,
        }
    }

    pub fn from_typecode(code: i64) -> Option<TextKind> {
        [
            TextKind::Plain,
            TextKind::Paragraph,
            TextKind::Document,
            TextKind::PersonName,
            TextKind::EmailAddress,
            TextKind::Url,
            TextKind::Postcode,
            TextKind::Telephone,
            TextKind::ConfigurationName,
        ]
        .into_iter()
        .find(|k| k.typecode() == code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Text {
    pub kind: TextKind,
    pub text: String,
}

impl Text {
    pub fn new(kind: TextKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }
    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(TextKind::Plain, text)
    }

    /// Canonical string for the identifier index, or `None` for kinds
    /// which are not identifiers.
    pub fn to_identifier_index_str(&self) -> Option<String> {
        let s = match self.kind {
            TextKind::EmailAddress => self.text.trim().to_lowercase(),
            TextKind::Url => self.text.trim().trim_end_matches('/').to_lowercase(),
            TextKind::Postcode => self.text.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase(),
            // reversed so that suffix searches become prefix searches
            TextKind::Telephone => digits().replace_all(&self.text, "").chars().rev().collect(),
            TextKind::ConfigurationName => self.text.trim().to_string(),
            _ => return None,
        };
        (!s.is_empty()).then_some(s)
    }

    /// Text handed to the term extractor.
    pub fn to_terms_text(&self) -> Cow<'_, str> {
        match self.kind {
            TextKind::EmailAddress | TextKind::Url => Cow::Owned(self.text.replace(['@', '.', '/', ':'], " ")),
            TextKind::Document => Cow::Owned(markup().replace_all(&self.text, " ").into_owned()),
            _ => Cow::Borrowed(&self.text),
        }
    }

    /// Large values are skipped when pulling terms across links.
    pub fn is_slow_to_index(&self) -> bool {
        matches!(self.kind, TextKind::Document)
    }

    pub fn to_sortas_form(&self) -> String {
        match self.kind {
            // "First Last" sorts as "last first"
            TextKind::PersonName => {
                let mut parts: Vec<&str> = self.text.split_whitespace().collect();
                if let Some(last) = parts.pop() {
                    parts.insert(0, last);
                }
                parts.join(" ")
            }
            _ => self.text.clone(),
        }
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9]").expect("static regex"))
}

fn markup() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex"))
}

fn leading_noise() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:the|a|an)\s+|[^\p{L}\p{N}\s]").expect("static regex"))
}

/// Lowercased, punctuation-free form used for title sorting and exact
/// title matching. Leading English articles are dropped.
pub fn sort_as_normalise(s: &str) -> String {
    let lower = s.trim().to_lowercase();
    let stripped = leading_noise().replace_all(&lower, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Half-open `[start, end)` time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateTimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateTimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        if end < start { Self { start: end, end: start } } else { Self { start, end } }
    }

    pub fn instant(at: DateTime<Utc>) -> Self {
        Self { start: at, end: at }
    }
}

/// Attribute value. A closed set of kinds, each routed to exactly one
/// secondary index table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "k", content = "v", rename_all = "snake_case")]
pub enum Value {
    Integer(i64),
    Ref(ObjRef),
    DateTime(DateTimeRange),
    Text(Text),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(Text::plain(s))
    }

    pub fn as_objref(&self) -> Option<ObjRef> {
        match self { Value::Ref(r) => Some(*r), _ => None }
    }

    pub fn as_text(&self) -> Option<&Text> {
        match self { Value::Text(t) => Some(t), _ => None }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self { Value::Integer(i) => Some(*i), _ => None }
    }

    pub fn as_datetime(&self) -> Option<&DateTimeRange> {
        match self { Value::DateTime(d) => Some(d), _ => None }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Ref(r) => write!(f, "@{}", r),
            Value::DateTime(d) if d.start == d.end => write!(f, "{}", d.start.to_rfc3339()),
            Value::DateTime(d) => write!(f, "{} .. {}", d.start.to_rfc3339(), d.end.to_rfc3339()),
            Value::Text(t) => f.write_str(&t.text),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::Ref(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl From<Text> for Value {
    fn from(t: Text) -> Self {
        Value::Text(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_forms() {
        let phone = Text::new(TextKind::Telephone, "+44 (0)20 7946-0123");
        assert_eq!(phone.to_identifier_index_str().unwrap(), "3210649702044");
        let email = Text::new(TextKind::EmailAddress, " Ann@Example.COM ");
        assert_eq!(email.to_identifier_index_str().unwrap(), "ann@example.com");
        assert_eq!(Text::new(TextKind::Postcode, "sw1a 1aa").to_identifier_index_str().unwrap(), "SW1A1AA");
        assert!(Text::plain("hello").to_identifier_index_str().is_none());
    }

    #[test]
    fn sortas() {
        assert_eq!(sort_as_normalise("  The Big, Contract! "), "big contract");
        let name = Text::new(TextKind::PersonName, "Ada Lovelace");
        assert_eq!(sort_as_normalise(&name.to_sortas_form()), "lovelace ada");
    }

    #[test]
    fn typecodes_round_trip() {
        for k in [TextKind::Plain, TextKind::Telephone, TextKind::ConfigurationName] {
            assert_eq!(TextKind::from_typecode(k.typecode()), Some(k));
        }
    }
}
