//! Tokenizer-free parser for parenthesized connect descriptors
//!
//! ```text
//! node  := '(' key '=' value ')'
//! value := node+ | '"' text '"' | text
//! ```
//!
//! Keys are case-insensitive and returned lowercased; surrounding whitespace
//! is ignored everywhere.

use crate::error::ProbeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    List(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    pub value: Value,
}

impl Node {
    /// Text value of a leaf node
    ///
    /// # Errors
    ///
    /// Returns an error if the node holds nested nodes
    pub fn text(&self) -> Result<&str, ProbeError> {
        match &self.value {
            Value::Text(text) => Ok(text.as_str()),
            Value::List(_) => Err(invalid(format!("{} expects a value, not a list", self.key))),
        }
    }

    /// Nested nodes of a branch node
    ///
    /// # Errors
    ///
    /// Returns an error if the node holds a plain value
    pub fn children(&self) -> Result<&[Node], ProbeError> {
        match &self.value {
            Value::List(nodes) => Ok(nodes.as_slice()),
            Value::Text(_) => Err(invalid(format!(
                "{} expects nested (key=value) pairs",
                self.key
            ))),
        }
    }
}

/// Deepest nesting accepted
pub const MAX_DEPTH: usize = 32;

fn invalid(message: impl Into<String>) -> ProbeError {
    ProbeError::InvalidDescriptor(message.into())
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    const fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ProbeError> {
        self.skip_whitespace();
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(invalid(format!(
                "expected '{}' at offset {}, found '{}'",
                char::from(byte),
                self.pos,
                char::from(b)
            ))),
            None => Err(invalid(format!(
                "expected '{}' but the descriptor ended",
                char::from(byte)
            ))),
        }
    }

    /// Consume bytes up to (not including) any of `stops`
    fn take_until(&mut self, stops: &[u8]) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(|b| !stops.contains(&b)) {
            self.pos += 1;
        }
        self.input.get(start..self.pos).unwrap_or_default()
    }

    fn nodes(&mut self) -> Result<Vec<Node>, ProbeError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'(') {
                break;
            }
            nodes.push(self.node()?);
        }
        Ok(nodes)
    }

    fn node(&mut self) -> Result<Node, ProbeError> {
        if self.depth >= MAX_DEPTH {
            return Err(invalid(format!(
                "nesting deeper than {MAX_DEPTH} levels at offset {}",
                self.pos
            )));
        }
        self.depth += 1;
        let node = self.node_body();
        self.depth -= 1;
        node
    }

    fn node_body(&mut self) -> Result<Node, ProbeError> {
        self.expect(b'(')?;
        self.skip_whitespace();
        let key = self.take_until(b"=()").trim().to_lowercase();
        if key.is_empty() {
            return Err(invalid(format!("missing key at offset {}", self.pos)));
        }
        self.expect(b'=')?;
        self.skip_whitespace();

        let value = match self.peek() {
            Some(b'(') => Value::List(self.nodes()?),
            Some(b'"') => {
                self.pos += 1;
                let text = self.take_until(b"\"");
                self.expect(b'"')?;
                Value::Text(text.to_string())
            }
            _ => Value::Text(self.take_until(b"()").trim().to_string()),
        };

        self.expect(b')').map_err(|_| invalid(format!("unbalanced parentheses after {key}")))?;
        Ok(Node { key, value })
    }
}

/// Parse a descriptor into its top-level nodes
///
/// # Errors
///
/// Returns `InvalidDescriptor` on unbalanced parentheses, missing keys or
/// trailing garbage
pub fn parse(input: &str) -> Result<Vec<Node>, ProbeError> {
    let mut parser = Parser::new(input);
    let nodes = parser.nodes()?;
    parser.skip_whitespace();

    if let Some(b) = parser.peek() {
        return Err(invalid(format!(
            "unexpected '{}' at offset {}",
            char::from(b),
            parser.pos
        )));
    }
    if nodes.is_empty() {
        return Err(invalid("empty descriptor"));
    }

    Ok(nodes)
}
