use std::fmt;

use serde_json::Value;
use thiserror::Error;

use stepwise_core::error::StepwiseError;
use stepwise_graph::ExecutionContext;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredicateError {
    #[error("cannot parse condition `{input}`: {message}")]
    Parse { input: String, message: String },

    #[error("value of `{key}` is not numeric: {value}")]
    NotNumeric { key: String, value: String },

    #[error("invalid regex `{pattern}`: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("predicate node {0} references a missing or later node")]
    DanglingReference(usize),
}

impl From<PredicateError> for StepwiseError {
    fn from(e: PredicateError) -> Self {
        StepwiseError::Predicate(e.to_string())
    }
}

/// Index of a node inside a [`Predicate`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredicateId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Ge => lhs >= rhs,
            Self::Le => lhs <= rhs,
        }
    }
}

/// One typed test over the context. Composite nodes refer to children by
/// arena index; a child must sit at a lower index than its parent.
#[derive(Debug, Clone, PartialEq)]
pub enum PredicateNode {
    Exists(String),
    Truthy(String),
    Equals(String, Value),
    NotEquals(String, Value),
    Contains(String, String),
    Matches(String, String),
    Compare(String, CompareOp, f64),
    Not(PredicateId),
    All(Vec<PredicateId>),
    Any(Vec<PredicateId>),
}

/// Breakpoint condition stored as an arena of [`PredicateNode`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    nodes: Vec<PredicateNode>,
    root: PredicateId,
    source: Option<String>,
}

impl Predicate {
    /// A predicate made of a single node.
    pub fn leaf(node: PredicateNode) -> Self {
        Self {
            nodes: vec![node],
            root: PredicateId(0),
            source: None,
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::leaf(PredicateNode::Exists(key.into()))
    }

    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(PredicateNode::Equals(key.into(), value.into()))
    }

    /// Append a node and make it the root.
    pub fn push(&mut self, node: PredicateNode) -> PredicateId {
        self.nodes.push(node);
        self.root = PredicateId(self.nodes.len() - 1);
        self.root
    }

    pub fn root(&self) -> PredicateId {
        self.root
    }

    pub fn set_root(&mut self, id: PredicateId) {
        self.root = id;
    }

    pub fn nodes(&self) -> &[PredicateNode] {
        &self.nodes
    }

    /// Textual form this predicate was parsed from, if any.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn parse(input: &str) -> Result<Self, PredicateError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            input,
            tokens,
            pos: 0,
            nodes: Vec::new(),
        };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            nodes: parser.nodes,
            root,
            source: Some(input.trim().to_string()),
        })
    }

    pub fn evaluate(&self, context: &ExecutionContext) -> Result<bool, PredicateError> {
        self.eval_node(self.root, self.nodes.len(), context)
    }

    fn eval_node(
        &self,
        id: PredicateId,
        bound: usize,
        context: &ExecutionContext,
    ) -> Result<bool, PredicateError> {
        if id.0 >= bound {
            return Err(PredicateError::DanglingReference(id.0));
        }
        let node = &self.nodes[id.0];
        let result = match node {
            PredicateNode::Exists(key) => lookup(context, key).is_some(),
            PredicateNode::Truthy(key) => lookup(context, key).is_some_and(truthy),
            PredicateNode::Equals(key, expected) => {
                lookup(context, key).is_some_and(|v| loosely_equal(v, expected))
            }
            PredicateNode::NotEquals(key, expected) => {
                lookup(context, key).is_none_or(|v| !loosely_equal(v, expected))
            }
            PredicateNode::Contains(key, needle) => {
                lookup(context, key).is_some_and(|v| contains(v, needle))
            }
            PredicateNode::Matches(key, pattern) => {
                let re = regex::Regex::new(pattern).map_err(|e| PredicateError::InvalidRegex {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                match lookup(context, key) {
                    Some(Value::String(s)) => re.is_match(s),
                    Some(other) => re.is_match(&other.to_string()),
                    None => false,
                }
            }
            PredicateNode::Compare(key, op, rhs) => match lookup(context, key) {
                Some(value) => op.apply(as_number(key, value)?, *rhs),
                None => false,
            },
            PredicateNode::Not(child) => !self.eval_node(*child, id.0, context)?,
            PredicateNode::All(children) => {
                for child in children {
                    if !self.eval_node(*child, id.0, context)? {
                        return Ok(false);
                    }
                }
                true
            }
            PredicateNode::Any(children) => {
                for child in children {
                    if self.eval_node(*child, id.0, context)? {
                        return Ok(true);
                    }
                }
                false
            }
        };
        Ok(result)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => f.write_str(src),
            None => write!(f, "<{} predicate nodes>", self.nodes.len()),
        }
    }
}

/// Exact key first, then a dotted path into nested objects.
fn lookup<'a>(context: &'a ExecutionContext, key: &str) -> Option<&'a Value> {
    if let Some(v) = context.get(key) {
        return Some(v);
    }
    let mut parts = key.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

fn contains(haystack: &Value, needle: &str) -> bool {
    match haystack {
        Value::String(s) => s.contains(needle),
        Value::Array(items) => items.iter().any(|item| match item {
            Value::String(s) => s == needle,
            other => other.to_string() == needle,
        }),
        Value::Object(map) => map.contains_key(needle),
        _ => false,
    }
}

fn as_number(key: &str, value: &Value) -> Result<f64, PredicateError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| PredicateError::NotNumeric {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, PredicateError> {
    let parse_error = |message: String| PredicateError::Parse {
        input: input.to_string(),
        message,
    };

    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let op = match two.as_str() {
            "==" => Some("=="),
            "!=" => Some("!="),
            ">=" => Some(">="),
            "<=" => Some("<="),
            "&&" => Some("&&"),
            "||" => Some("||"),
            _ => None,
        };
        if let Some(op) = op {
            tokens.push(Token::Op(op));
            i += 2;
            continue;
        }

        match c {
            '>' => tokens.push(Token::Op(">")),
            '<' => tokens.push(Token::Op("<")),
            '!' => tokens.push(Token::Op("!")),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            '"' | '\'' => {
                let mut j = i + 1;
                let mut text = String::new();
                while j < chars.len() && chars[j] != c {
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        j += 1;
                    }
                    text.push(chars[j]);
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(parse_error("unterminated string literal".into()));
                }
                tokens.push(Token::Literal(Value::String(text)));
                i = j + 1;
                continue;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                let number: f64 = text
                    .parse()
                    .map_err(|_| parse_error(format!("bad number `{}`", text)))?;
                let value = if text.contains('.') {
                    serde_json::Number::from_f64(number).map(Value::Number)
                } else {
                    text.parse::<i64>().ok().map(|n| Value::Number(n.into()))
                };
                tokens.push(Token::Literal(
                    value.ok_or_else(|| parse_error(format!("bad number `{}`", text)))?,
                ));
                i = j;
                continue;
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].is_alphanumeric() || matches!(chars[j], '_' | '.' | '-'))
                {
                    j += 1;
                }
                let word: String = chars[i..j].iter().collect();
                let token = match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "and" => Token::Op("&&"),
                    "or" => Token::Op("||"),
                    "not" => Token::Op("!"),
                    _ => Token::Ident(word),
                };
                tokens.push(token);
                i = j;
                continue;
            }
            other => return Err(parse_error(format!("unexpected character `{}`", other))),
        }
        i += 1;
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    nodes: Vec<PredicateNode>,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> PredicateError {
        PredicateError::Parse {
            input: self.input.to_string(),
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn push(&mut self, node: PredicateNode) -> PredicateId {
        self.nodes.push(node);
        PredicateId(self.nodes.len() - 1)
    }

    fn expr(&mut self) -> Result<PredicateId, PredicateError> {
        let mut terms = vec![self.and()?];
        while self.peek() == Some(&Token::Op("||")) {
            self.pos += 1;
            terms.push(self.and()?);
        }
        Ok(match terms.len() {
            1 => terms[0],
            _ => self.push(PredicateNode::Any(terms)),
        })
    }

    fn and(&mut self) -> Result<PredicateId, PredicateError> {
        let mut terms = vec![self.unary()?];
        while self.peek() == Some(&Token::Op("&&")) {
            self.pos += 1;
            terms.push(self.unary()?);
        }
        Ok(match terms.len() {
            1 => terms[0],
            _ => self.push(PredicateNode::All(terms)),
        })
    }

    fn unary(&mut self) -> Result<PredicateId, PredicateError> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.pos += 1;
                let inner = self.unary()?;
                Ok(self.push(PredicateNode::Not(inner)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected `)`")),
                }
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<PredicateId, PredicateError> {
        let key = match self.next() {
            Some(Token::Ident(word)) if word == "exists" => {
                let key = self.ident()?;
                return Ok(self.push(PredicateNode::Exists(key)));
            }
            Some(Token::Ident(word)) => word,
            _ => return Err(self.error("expected a context key")),
        };

        let node = match self.peek().cloned() {
            Some(Token::Op(op @ ("==" | "!=" | ">" | "<" | ">=" | "<="))) => {
                self.pos += 1;
                let literal = self.literal()?;
                match op {
                    "==" => PredicateNode::Equals(key, literal),
                    "!=" => PredicateNode::NotEquals(key, literal),
                    _ => {
                        let rhs = literal
                            .as_f64()
                            .ok_or_else(|| self.error("comparison needs a numeric literal"))?;
                        let cmp = match op {
                            ">" => CompareOp::Gt,
                            "<" => CompareOp::Lt,
                            ">=" => CompareOp::Ge,
                            _ => CompareOp::Le,
                        };
                        PredicateNode::Compare(key, cmp, rhs)
                    }
                }
            }
            Some(Token::Ident(word)) if word == "contains" || word == "matches" => {
                self.pos += 1;
                let text = match self.literal()? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                if word == "contains" {
                    PredicateNode::Contains(key, text)
                } else {
                    PredicateNode::Matches(key, text)
                }
            }
            _ => PredicateNode::Truthy(key),
        };
        Ok(self.push(node))
    }

    fn ident(&mut self) -> Result<String, PredicateError> {
        match self.next() {
            Some(Token::Ident(word)) => Ok(word),
            _ => Err(self.error("expected a context key")),
        }
    }

    fn literal(&mut self) -> Result<Value, PredicateError> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(v),
            Some(Token::Ident(word)) => Ok(Value::String(word)),
            _ => Err(self.error("expected a literal")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> ExecutionContext {
        ExecutionContext::from_json(value).unwrap()
    }

    #[test]
    fn parses_equality_and_inequality() {
        let c = ctx(json!({"status": "failure", "retries": 2}));
        assert!(Predicate::parse(r#"status == "failure""#).unwrap().evaluate(&c).unwrap());
        assert!(!Predicate::parse(r#"status != "failure""#).unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse("retries == 2").unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse("retries == 2.0").unwrap().evaluate(&c).unwrap());
    }

    #[test]
    fn numeric_comparisons() {
        let c = ctx(json!({"score": 0.75, "count": "4"}));
        assert!(Predicate::parse("score > 0.5").unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse("score <= 0.75").unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse("count >= 4").unwrap().evaluate(&c).unwrap());
        assert!(!Predicate::parse("missing > 1").unwrap().evaluate(&c).unwrap());
    }

    #[test]
    fn non_numeric_comparison_is_an_error() {
        let c = ctx(json!({"name": "alpha"}));
        let err = Predicate::parse("name > 3").unwrap().evaluate(&c).unwrap_err();
        assert!(matches!(err, PredicateError::NotNumeric { .. }));
    }

    #[test]
    fn contains_matches_and_exists() {
        let c = ctx(json!({"log": "timeout after 30s", "tags": ["slow", "retry"], "meta": {"a": 1}}));
        assert!(Predicate::parse(r#"log contains "timeout""#).unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse(r#"tags contains "retry""#).unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse(r#"log matches "after \\d+s""#).unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse("exists meta.a").unwrap().evaluate(&c).unwrap());
        assert!(!Predicate::parse("exists meta.b").unwrap().evaluate(&c).unwrap());
    }

    #[test]
    fn absent_keys_only_satisfy_inequality() {
        let c = ctx(json!({"zero": 0, "delta": -0.5}));
        assert!(!Predicate::parse("missing").unwrap().evaluate(&c).unwrap());
        assert!(!Predicate::parse("zero").unwrap().evaluate(&c).unwrap());
        assert!(!Predicate::parse(r#"missing == "x""#).unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse(r#"missing != "x""#).unwrap().evaluate(&c).unwrap());
        assert!(!Predicate::parse(r#"missing contains "x""#).unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse("delta > -1").unwrap().evaluate(&c).unwrap());
    }

    #[test]
    fn invalid_regex_fails_at_evaluation() {
        let c = ctx(json!({"log": "x"}));
        let p = Predicate::parse(r#"log matches "(unclosed""#).unwrap();
        assert!(matches!(p.evaluate(&c), Err(PredicateError::InvalidRegex { .. })));
    }

    #[test]
    fn boolean_composition() {
        let c = ctx(json!({"a": true, "b": false, "n": 3}));
        assert!(Predicate::parse("a && !b").unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse("b || n > 2").unwrap().evaluate(&c).unwrap());
        assert!(!Predicate::parse("!(a || b)").unwrap().evaluate(&c).unwrap());
        assert!(Predicate::parse("a and not b").unwrap().evaluate(&c).unwrap());
    }

    #[test]
    fn parse_errors() {
        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("a ==").is_err());
        assert!(Predicate::parse(r#"a == "open"#).is_err());
        assert!(Predicate::parse("(a && b").is_err());
        assert!(Predicate::parse("a > \"x\"").is_err());
        assert!(Predicate::parse("a b").is_err());
    }

    #[test]
    fn dangling_reference_is_reported() {
        let mut p = Predicate::exists("a");
        p.push(PredicateNode::Not(PredicateId(7)));
        let err = p.evaluate(&ExecutionContext::new()).unwrap_err();
        assert_eq!(err, PredicateError::DanglingReference(7));
    }

    #[test]
    fn self_reference_is_rejected() {
        let mut p = Predicate::exists("a");
        let id = p.push(PredicateNode::Not(PredicateId(1)));
        assert_eq!(id, PredicateId(1));
        assert!(p.evaluate(&ExecutionContext::new()).is_err());
    }

    #[test]
    fn display_uses_source() {
        let p = Predicate::parse("  retries > 1 ").unwrap();
        assert_eq!(p.to_string(), "retries > 1");
        assert_eq!(p.source(), Some("retries > 1"));
    }
}
