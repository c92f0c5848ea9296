//! Path queries over response trees.
//!
//! Control-plane responses are handled as [`serde_json::Value`] trees and
//! picked apart with a small query language, a subset of JMESPath:
//!
//! | Syntax                 | Meaning                                           |
//! |------------------------|---------------------------------------------------|
//! | `cluster.id`           | nested field access                               |
//! | `"error-code"`         | quoted field name                                 |
//! | `items[0]`, `items[-1]`| array index, negative counts from the end         |
//! | `items[*].id`          | projection over every element                     |
//! | `groups[]`             | flatten one level, then project                   |
//! | `items[?status=='RUNNING']` | filter, then project                         |
//! | `a \| b`               | pipe: stop projecting, feed the result onward     |
//!
//! Filter literals may be `'raw strings'`, `` `json` ``, bare numbers, or
//! `true`/`false`/`null`. `[?field]` keeps elements whose field is truthy and
//! `@` refers to the element itself.
//!
//! Missing fields never fail; they evaluate to `null`, and projections drop
//! `null` results.
//!
//! # Example
//!
//! ```
//! use hemmer_reconcile::query::Query;
//! use serde_json::json;
//!
//! let body = json!({"detailList": [
//!     {"id": "a", "status": "SUCCESS"},
//!     {"id": "b", "status": "RUNNING"},
//! ]});
//! let query = Query::parse("detailList | [?status=='RUNNING'] | [0].id").unwrap();
//! assert_eq!(query.search(&body), json!("b"));
//! ```

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Errors raised while parsing a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The query string was empty.
    #[error("empty query")]
    Empty,

    /// The query string is malformed.
    #[error("syntax error in query `{query}` at position {position}: {message}")]
    Syntax {
        /// The offending query.
        query: String,
        /// Character offset of the error.
        position: usize,
        /// What the parser expected.
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Index(i64),
    Wildcard,
    Flatten,
    Filter(Predicate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
struct Predicate {
    /// Field path relative to the element; empty means the element itself.
    path: Vec<String>,
    comparison: Option<(Comparator, Value)>,
}

impl Predicate {
    fn matches(&self, item: &Value) -> bool {
        let mut current = Some(item);
        for name in &self.path {
            current = current.and_then(|v| v.get(name.as_str()));
        }
        let found = current.unwrap_or(&Value::Null);

        match &self.comparison {
            None => is_truthy(found),
            Some((Comparator::Eq, literal)) => values_equal(found, literal),
            Some((Comparator::Ne, literal)) => !values_equal(found, literal),
        }
    }
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    source: String,
    segments: Vec<Vec<Step>>,
}

impl Query {
    /// Parse a query expression.
    pub fn parse(expr: &str) -> Result<Self, QueryError> {
        if expr.trim().is_empty() {
            return Err(QueryError::Empty);
        }
        let segments = Parser::new(expr).parse_query()?;
        Ok(Self {
            source: expr.to_string(),
            segments,
        })
    }

    /// The expression this query was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate the query against a response tree.
    pub fn search(&self, value: &Value) -> Value {
        let mut current = value.clone();
        for segment in &self.segments {
            current = evaluate(segment, &current);
        }
        current
    }
}

impl FromStr for Query {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and evaluate `expr` against `value`.
pub fn path_search(expr: &str, value: &Value) -> Result<Value, QueryError> {
    Ok(Query::parse(expr)?.search(value))
}

/// Evaluate `expr`, falling back to `default` when the result is `null` or the
/// expression does not parse.
pub fn path_search_or(expr: &str, value: &Value, default: Value) -> Value {
    match path_search(expr, value) {
        Ok(Value::Null) => default,
        Ok(found) => found,
        Err(err) => {
            warn!(error = %err, "Invalid response query, using default");
            default
        },
    }
}

/// Evaluate `expr` and return the result as a string.
///
/// Numbers are rendered with their JSON representation; any other non-string
/// result yields `None`.
pub fn path_str(expr: &str, value: &Value) -> Option<String> {
    match path_search_or(expr, value, Value::Null) {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn evaluate(steps: &[Step], value: &Value) -> Value {
    let Some((step, rest)) = steps.split_first() else {
        return value.clone();
    };

    match step {
        Step::Field(name) => match value.get(name.as_str()) {
            Some(child) => evaluate(rest, child),
            None => Value::Null,
        },
        Step::Index(index) => {
            let item = value.as_array().and_then(|items| {
                resolve_index(items.len(), *index).and_then(|idx| items.get(idx))
            });
            match item {
                Some(item) => evaluate(rest, item),
                None => Value::Null,
            }
        },
        Step::Wildcard => match value.as_array() {
            Some(items) => project(items.iter(), rest),
            None => Value::Null,
        },
        Step::Flatten => match value.as_array() {
            Some(items) => {
                let mut flattened = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Array(inner) => flattened.extend(inner.iter()),
                        other => flattened.push(other),
                    }
                }
                project(flattened.into_iter(), rest)
            },
            None => Value::Null,
        },
        Step::Filter(predicate) => match value.as_array() {
            Some(items) => project(items.iter().filter(|item| predicate.matches(item)), rest),
            None => Value::Null,
        },
    }
}

fn project<'a>(items: impl Iterator<Item = &'a Value>, rest: &[Step]) -> Value {
    Value::Array(
        items
            .map(|item| evaluate(rest, item))
            .filter(|v| !v.is_null())
            .collect(),
    )
}

fn resolve_index(len: usize, index: i64) -> Option<usize> {
    if index >= 0 {
        let idx = usize::try_from(index).ok()?;
        (idx < len).then_some(idx)
    } else {
        let back = usize::try_from(index.unsigned_abs()).ok()?;
        len.checked_sub(back)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Number(_) => true,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

struct Parser<'a> {
    query: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(query: &'a str) -> Self {
        Self {
            query,
            chars: query.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::Syntax {
            query: self.query.to_string(),
            position: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn starts_with(&self, token: &str) -> bool {
        token
            .chars()
            .enumerate()
            .all(|(offset, c)| self.chars.get(self.pos + offset) == Some(&c))
    }

    fn expect(&mut self, c: char) -> Result<(), QueryError> {
        self.skip_whitespace();
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c)))
        }
    }

    fn parse_query(&mut self) -> Result<Vec<Vec<Step>>, QueryError> {
        let mut segments = vec![self.parse_segment()?];
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Ok(segments),
                Some('|') => {
                    self.pos += 1;
                    segments.push(self.parse_segment()?);
                },
                Some(c) => return Err(self.error(format!("unexpected character '{}'", c))),
            }
        }
    }

    fn parse_segment(&mut self) -> Result<Vec<Step>, QueryError> {
        self.skip_whitespace();
        let mut steps = Vec::new();
        match self.peek() {
            Some('[') => steps.push(self.parse_bracket()?),
            Some(_) => steps.push(Step::Field(self.parse_identifier()?)),
            None => return Err(self.error("expected an expression")),
        }

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    steps.push(Step::Field(self.parse_identifier()?));
                },
                Some('[') => steps.push(self.parse_bracket()?),
                _ => return Ok(steps),
            }
        }
    }

    fn parse_bracket(&mut self) -> Result<Step, QueryError> {
        self.expect('[')?;
        self.skip_whitespace();
        let step = match self.peek() {
            Some('*') => {
                self.pos += 1;
                Step::Wildcard
            },
            Some(']') => Step::Flatten,
            Some('?') => {
                self.pos += 1;
                Step::Filter(self.parse_predicate()?)
            },
            Some(c) if c == '-' || c.is_ascii_digit() => Step::Index(self.parse_integer()?),
            _ => return Err(self.error("expected index, '*', '?' or ']'")),
        };
        self.expect(']')?;
        Ok(step)
    }

    fn parse_integer(&mut self) -> Result<i64, QueryError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse()
            .map_err(|_| self.error(format!("invalid index '{}'", text)))
    }

    fn parse_identifier(&mut self) -> Result<String, QueryError> {
        self.skip_whitespace();
        match self.peek() {
            Some('"') => {
                self.pos += 1;
                self.parse_delimited('"')
            },
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    self.pos += 1;
                }
                Ok(self.chars[start..self.pos].iter().collect())
            },
            _ => Err(self.error("expected an identifier")),
        }
    }

    /// Read up to an unescaped `delimiter`; the opening delimiter is already
    /// consumed.
    fn parse_delimited(&mut self, delimiter: char) -> Result<String, QueryError> {
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error(format!("unterminated {}", delimiter))),
                Some('\\') if self.chars.get(self.pos + 1) == Some(&delimiter) => {
                    out.push(delimiter);
                    self.pos += 2;
                },
                Some(c) if c == delimiter => {
                    self.pos += 1;
                    return Ok(out);
                },
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                },
            }
        }
    }

    fn parse_predicate(&mut self) -> Result<Predicate, QueryError> {
        self.skip_whitespace();
        let mut path = Vec::new();
        if self.peek() == Some('@') {
            self.pos += 1;
        } else {
            path.push(self.parse_identifier()?);
            loop {
                self.skip_whitespace();
                if self.peek() != Some('.') {
                    break;
                }
                self.pos += 1;
                path.push(self.parse_identifier()?);
            }
        }

        self.skip_whitespace();
        let comparator = if self.starts_with("==") {
            Some(Comparator::Eq)
        } else if self.starts_with("!=") {
            Some(Comparator::Ne)
        } else {
            None
        };

        let comparison = match comparator {
            Some(comparator) => {
                self.pos += 2;
                Some((comparator, self.parse_literal()?))
            },
            None => None,
        };

        Ok(Predicate { path, comparison })
    }

    fn parse_literal(&mut self) -> Result<Value, QueryError> {
        self.skip_whitespace();
        match self.peek() {
            Some('\'') => {
                self.pos += 1;
                Ok(Value::String(self.parse_delimited('\'')?))
            },
            Some('`') => {
                self.pos += 1;
                let raw = self.parse_delimited('`')?;
                serde_json::from_str(&raw)
                    .map_err(|e| self.error(format!("invalid JSON literal: {}", e)))
            },
            Some(c) if c == '-' || c.is_ascii_digit() => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
                {
                    self.pos += 1;
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                serde_json::from_str(&text)
                    .map_err(|_| self.error(format!("invalid number '{}'", text)))
            },
            Some(c) if c.is_ascii_alphabetic() => {
                let word = self.parse_identifier()?;
                match word.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" => Ok(Value::Null),
                    _ => Err(self.error(format!("unknown literal '{}'", word))),
                }
            },
            _ => Err(self.error("expected a literal")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search(expr: &str, value: &Value) -> Value {
        Query::parse(expr).unwrap().search(value)
    }

    #[test]
    fn test_nested_fields() {
        let body = json!({"cluster": {"id": "c-1", "name": "es"}});
        assert_eq!(search("cluster.id", &body), json!("c-1"));
        assert_eq!(search("cluster.missing", &body), Value::Null);
        assert_eq!(search("nothing.here", &body), Value::Null);
    }

    #[test]
    fn test_quoted_field() {
        let body = json!({"error-code": "X.1"});
        assert_eq!(search("\"error-code\"", &body), json!("X.1"));
    }

    #[test]
    fn test_indexes() {
        let body = json!({"items": [1, 2, 3]});
        assert_eq!(search("items[0]", &body), json!(1));
        assert_eq!(search("items[-1]", &body), json!(3));
        assert_eq!(search("items[3]", &body), Value::Null);
        assert_eq!(search("items[-4]", &body), Value::Null);
    }

    #[test]
    fn test_projection_drops_nulls() {
        let body = json!({"nodes": [{"ip": "10.0.0.1"}, {"name": "x"}, {"ip": "10.0.0.2"}]});
        assert_eq!(
            search("nodes[*].ip", &body),
            json!(["10.0.0.1", "10.0.0.2"])
        );
    }

    #[test]
    fn test_filter_pipe_index() {
        let body = json!({"detailList": [
            {"id": "t-1", "status": "SUCCESS"},
            {"id": "t-2", "status": "RUNNING"},
        ]});
        assert_eq!(
            search("detailList | [?status=='RUNNING'] | [0]", &body),
            json!({"id": "t-2", "status": "RUNNING"})
        );
        assert_eq!(
            search("detailList[?status != 'RUNNING'].id", &body),
            json!(["t-1"])
        );
    }

    #[test]
    fn test_index_inside_projection_applies_per_element() {
        let body = json!({"groups": [{"ids": [1, 2]}, {"ids": [3]}]});
        assert_eq!(search("groups[*].ids[0]", &body), json!([1, 3]));
        assert_eq!(search("groups[*].ids | [0]", &body), json!([1, 2]));
    }

    #[test]
    fn test_leading_index_after_pipe() {
        let body = json!({"errors": [{"error_code": "DLF.0100"}]});
        assert_eq!(search("errors|[0].error_code", &body), json!("DLF.0100"));
    }

    #[test]
    fn test_flatten() {
        let body = json!({"groups": [[1, 2], [3], 4]});
        assert_eq!(search("groups[]", &body), json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_filter_literals() {
        let body = json!({"items": [
            {"n": 1, "on": true, "tag": null},
            {"n": 2.0, "on": false, "tag": "x"},
        ]});
        assert_eq!(search("items[?n==`2`].tag", &body), json!(["x"]));
        assert_eq!(search("items[?n==1].on", &body), json!([true]));
        assert_eq!(search("items[?on==true].n", &body), json!([1]));
        assert_eq!(search("items[?tag==null].n", &body), json!([1]));
        assert_eq!(search("items[?tag].n", &body), json!([2.0]));
    }

    #[test]
    fn test_filter_on_element_itself() {
        let body = json!({"names": ["a", "b", "a"]});
        assert_eq!(search("names[?@=='a']", &body), json!(["a", "a"]));
    }

    #[test]
    fn test_operations_on_wrong_types_yield_null() {
        let body = json!({"status": "200"});
        assert_eq!(search("status[0]", &body), Value::Null);
        assert_eq!(search("status[*]", &body), Value::Null);
        assert_eq!(search("status[?x]", &body), Value::Null);
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(Query::parse("  "), Err(QueryError::Empty));
        assert!(matches!(
            Query::parse("a..b"),
            Err(QueryError::Syntax { .. })
        ));
        assert!(Query::parse("items[").is_err());
        assert!(Query::parse("items[?status=='x'").is_err());
        assert!(Query::parse("items[?status==maybe]").is_err());
        assert!(Query::parse("a |").is_err());
        assert!(Query::parse("a b").is_err());
    }

    #[test]
    fn test_path_search_helpers() {
        let body = json!({"id": "x", "count": 3, "flag": true});
        assert_eq!(path_search("id", &body).unwrap(), json!("x"));
        assert_eq!(path_search_or("missing", &body, json!("d")), json!("d"));
        assert_eq!(path_search_or("bad[", &body, json!(0)), json!(0));
        assert_eq!(path_str("id", &body), Some("x".to_string()));
        assert_eq!(path_str("count", &body), Some("3".to_string()));
        assert_eq!(path_str("flag", &body), None);
    }

    #[test]
    fn test_display_and_from_str() {
        let query: Query = "cluster.id".parse().unwrap();
        assert_eq!(query.to_string(), "cluster.id");
        assert_eq!(query.as_str(), "cluster.id");
    }
}
