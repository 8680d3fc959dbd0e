//! Dot/bracket path resolution over JSON values.
//!
//! Paths look like `items[0].content` or `source.url`. Syntax errors are
//! submission-time failures; resolution failures at runtime (missing key,
//! non-object traversal, out-of-range index) yield `None` and the caller
//! decides whether that skips the item or stores a null.

use serde_json::Value;

use crate::ParserError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathToken {
  Key(String),
  Index(usize),
}

/// A pre-tokenized path, parsed once per job and resolved per item.
#[derive(Debug, Clone)]
pub struct ParsedPath {
  raw: String,
  tokens: Vec<PathToken>,
}

impl ParsedPath {
  /// Tokenize a dot/bracket path. Accepts `name`, `.name`, and `[n]`
  /// segments; anything else is a syntax error.
  pub fn parse(path: &str) -> Result<Self, ParserError> {
    if path.is_empty() {
      return Err(ParserError::PathSyntax("path", "empty path".to_string()));
    }

    let mut tokens = Vec::new();
    let bytes = path.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
      match bytes[i] {
        b'.' => {
          i += 1;
          if i >= bytes.len() || bytes[i] == b'.' || bytes[i] == b'[' {
            return Err(ParserError::PathSyntax("path", format!("dangling '.' in {path:?}")));
          }
        }
        b'[' => {
          let close = path[i..]
            .find(']')
            .map(|off| i + off)
            .ok_or_else(|| ParserError::PathSyntax("path", format!("unclosed '[' in {path:?}")))?;
          let digits = &path[i + 1..close];
          let index: usize = digits
            .parse()
            .map_err(|_| ParserError::PathSyntax("path", format!("non-numeric index {digits:?} in {path:?}")))?;
          tokens.push(PathToken::Index(index));
          i = close + 1;
        }
        _ => {
          let rest = &path[i..];
          let end = rest.find(['.', '[']).unwrap_or(rest.len());
          let key = &rest[..end];
          if key.contains(']') {
            return Err(ParserError::PathSyntax("path", format!("stray ']' in {path:?}")));
          }
          tokens.push(PathToken::Key(key.to_string()));
          i += end;
        }
      }
    }

    if tokens.is_empty() {
      return Err(ParserError::PathSyntax("path", format!("no segments in {path:?}")));
    }

    Ok(Self {
      raw: path.to_string(),
      tokens,
    })
  }

  pub fn raw(&self) -> &str {
    &self.raw
  }

  /// Walk the path against a value. Any mismatch resolves to `None`.
  pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
    let mut current = value;
    for token in &self.tokens {
      current = match token {
        PathToken::Key(key) => current.as_object()?.get(key)?,
        PathToken::Index(index) => current.as_array()?.get(*index)?,
      };
    }
    Some(current)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn parses_plain_and_nested_keys() {
    let path = ParsedPath::parse("a.b.c").unwrap();
    assert_eq!(
      path.tokens,
      vec![
        PathToken::Key("a".into()),
        PathToken::Key("b".into()),
        PathToken::Key("c".into())
      ]
    );
  }

  #[test]
  fn parses_bracket_indices() {
    let path = ParsedPath::parse("items[0].content").unwrap();
    assert_eq!(
      path.tokens,
      vec![
        PathToken::Key("items".into()),
        PathToken::Index(0),
        PathToken::Key("content".into())
      ]
    );
  }

  #[test]
  fn rejects_bad_syntax() {
    assert!(ParsedPath::parse("").is_err());
    assert!(ParsedPath::parse("a..b").is_err());
    assert!(ParsedPath::parse("items[x]").is_err());
    assert!(ParsedPath::parse("items[0").is_err());
    assert!(ParsedPath::parse("a.").is_err());
  }

  #[test]
  fn resolves_nested_values() {
    let value = json!({"items": [{"content": "hello"}], "meta": {"lang": "en"}});
    assert_eq!(
      ParsedPath::parse("items[0].content").unwrap().resolve(&value),
      Some(&json!("hello"))
    );
    assert_eq!(
      ParsedPath::parse("meta.lang").unwrap().resolve(&value),
      Some(&json!("en"))
    );
  }

  #[test]
  fn resolution_failures_are_none() {
    let value = json!({"items": [{"content": "hello"}]});
    // missing key
    assert_eq!(ParsedPath::parse("missing").unwrap().resolve(&value), None);
    // out-of-range index
    assert_eq!(ParsedPath::parse("items[5]").unwrap().resolve(&value), None);
    // non-object traversal
    assert_eq!(ParsedPath::parse("items[0].content.deeper").unwrap().resolve(&value), None);
    // index into an object
    assert_eq!(ParsedPath::parse("items[0][0]").unwrap().resolve(&value), None);
  }
}
