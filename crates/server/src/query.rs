//! Query string parsing.
//!
//! Queries arrive percent-encoded in the URL and are written in the legacy
//! URLON dialect:
//!
//! | char | meaning |
//! |------|---------|
//! | `_`  | object, `key value` pairs separated by `&` |
//! | `@`  | array, values separated by `&` |
//! | `=`  | string |
//! | `:`  | literal (`true`, `false`, `null` or a number) |
//! | `;`  | closes the innermost object or array |
//! | `/`  | escapes the next character |
//!
//! The end of input closes every open container. Queries that are not URLON
//! are tried as JSON.

use percent_encoding::percent_decode_str;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Shorter query strings count as no query at all.
pub const MIN_QUERY_LEN: usize = 2;
/// Deepest nesting of objects and arrays accepted, same as serde_json.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("no query provided")]
    Missing,

    #[error("query is not valid UTF-8 after decoding")]
    Encoding,

    #[error("unexpected {found:?} at position {position}")]
    Unexpected { found: char, position: usize },

    #[error("unexpected end of query")]
    UnexpectedEnd,

    #[error("query nests deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("invalid literal {0:?}")]
    InvalidLiteral(String),

    #[error("query is neither URLON nor JSON: {0}")]
    Unparseable(String),
}

/// Decode and parse a raw query string.
pub fn parse(raw: &str) -> Result<Value, QueryError> {
    if raw.len() < MIN_QUERY_LEN {
        return Err(QueryError::Missing);
    }
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| QueryError::Encoding)?;

    match parse_urlon(&decoded) {
        Ok(value) => Ok(value),
        Err(urlon_error) => serde_json::from_str(&decoded).map_err(|json_error| {
            tracing::debug!(%urlon_error, %json_error, "Query rejected by both parsers");
            QueryError::Unparseable(urlon_error.to_string())
        }),
    }
}

/// Parse an already decoded URLON string.
pub fn parse_urlon(input: &str) -> Result<Value, QueryError> {
    let mut parser = Parser {
        chars: input.chars().collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    // Closing a top-level container explicitly is allowed
    while parser.peek() == Some(';') {
        parser.pos += 1;
    }
    match parser.peek() {
        None => Ok(value),
        Some(found) => Err(QueryError::Unexpected {
            found,
            position: parser.pos,
        }),
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    /// Open containers around the current position.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn unexpected(&self, found: char) -> QueryError {
        QueryError::Unexpected {
            found,
            position: self.pos.saturating_sub(1),
        }
    }

    fn value(&mut self) -> Result<Value, QueryError> {
        match self.bump() {
            Some('_') => self.nested(Self::object),
            Some('@') => self.nested(Self::array),
            Some('=') => Ok(Value::String(self.text())),
            Some(':') => self.literal(),
            Some(c) => Err(self.unexpected(c)),
            None => Err(QueryError::UnexpectedEnd),
        }
    }

    fn nested(
        &mut self,
        container: fn(&mut Self) -> Result<Value, QueryError>,
    ) -> Result<Value, QueryError> {
        if self.depth >= MAX_DEPTH {
            return Err(QueryError::TooDeep);
        }
        self.depth += 1;
        let value = container(self);
        self.depth -= 1;
        value
    }

    /// Characters up to the next unescaped `&` or `;`.
    fn text(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            match c {
                '&' | ';' => break,
                '/' => {
                    self.pos += 1;
                    if let Some(escaped) = self.bump() {
                        out.push(escaped);
                    }
                }
                _ => {
                    self.pos += 1;
                    out.push(c);
                }
            }
        }
        out
    }

    /// Characters up to the type marker of the value that follows.
    fn key(&mut self) -> Result<String, QueryError> {
        let mut out = String::new();
        loop {
            match self.peek() {
                Some('=' | ':' | '@' | '_') => return Ok(out),
                Some(c @ ('&' | ';')) => {
                    self.pos += 1;
                    return Err(self.unexpected(c));
                }
                Some('/') => {
                    self.pos += 1;
                    match self.bump() {
                        Some(escaped) => out.push(escaped),
                        None => return Err(QueryError::UnexpectedEnd),
                    }
                }
                Some(c) => {
                    self.pos += 1;
                    out.push(c);
                }
                None => return Err(QueryError::UnexpectedEnd),
            }
        }
    }

    fn object(&mut self) -> Result<Value, QueryError> {
        let mut map = Map::new();
        loop {
            match self.peek() {
                None => break,
                Some(';') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {}
            }
            let key = self.key()?;
            let value = self.value()?;
            map.insert(key, value);
            self.separator()?;
        }
        Ok(Value::Object(map))
    }

    fn array(&mut self) -> Result<Value, QueryError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => break,
                Some(';') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {}
            }
            items.push(self.value()?);
            self.separator()?;
        }
        Ok(Value::Array(items))
    }

    /// After a member: `&` continues, `;` or the end closes the container.
    fn separator(&mut self) -> Result<(), QueryError> {
        match self.peek() {
            Some('&') => {
                self.pos += 1;
                Ok(())
            }
            Some(';') | None => Ok(()),
            Some(c) => {
                self.pos += 1;
                Err(self.unexpected(c))
            }
        }
    }

    fn literal(&mut self) -> Result<Value, QueryError> {
        let text = self.text();
        match text.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" => Ok(Value::Null),
            _ => {
                if let Ok(n) = text.parse::<i64>() {
                    return Ok(Value::Number(n.into()));
                }
                text.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or(QueryError::InvalidLiteral(text))
            }
        }
    }
}
