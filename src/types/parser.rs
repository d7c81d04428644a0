//! Recursive-descent parser for ClickHouse type declarations.
//!
//! Grammar:
//!
//! ```text
//! type    := literal | identifier ( "(" arg ( "," arg )* ")" )?
//! arg     := ( identifier )? type        // field names only inside Tuple
//! literal := digits | "'" chars "'" ( "=" ["-"] digits )?
//! ```
//!
//! Whitespace between tokens is ignored and the whole input must be consumed.

use std::fmt;
use std::hash::{Hash, Hasher};

/// One node of a parsed type declaration.
///
/// Literal arguments (`10` in `Decimal(10, 2)`, `'UTC'` in `DateTime('UTC')`)
/// are nodes with no arguments whose name is the literal text, quotes
/// included. An enum entry's `= N` assignment is kept in `value`, which
/// does not take part in equality or hashing. Elements of a named tuple
/// (`Tuple(a String)`) carry their field name in `field`.
#[derive(Debug, Clone)]
pub struct TypeNode {
    /// The type name or literal text.
    pub name: String,
    /// Nested type arguments, empty for simple types.
    pub args: Vec<TypeNode>,
    /// The explicit value of an enum entry (`'label' = value`).
    pub value: Option<i64>,
    /// The field name of a named tuple element.
    pub field: Option<String>,
}

impl PartialEq for TypeNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.field == other.field && self.args == other.args
    }
}

impl Eq for TypeNode {}

impl Hash for TypeNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.field.hash(state);
        self.args.hash(state);
    }
}

impl TypeNode {
    /// Creates a simple node with no arguments.
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            value: None,
            field: None,
        }
    }

    /// Creates a node with nested arguments.
    pub fn with_args(name: impl Into<String>, args: Vec<TypeNode>) -> Self {
        Self {
            name: name.into(),
            args,
            value: None,
            field: None,
        }
    }

    /// Returns `true` if this node is a quoted string literal.
    pub fn is_string_literal(&self) -> bool {
        self.name.len() >= 2 && self.name.starts_with('\'') && self.name.ends_with('\'')
    }

    /// Returns the literal as an integer, if it is a numeric literal.
    pub fn as_integer(&self) -> Option<i64> {
        if self.args.is_empty() {
            self.name.parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "{} ", field)?;
        }
        f.write_str(&self.name)?;
        if let Some(value) = self.value {
            write!(f, " = {}", value)?;
        }
        if !self.args.is_empty() {
            f.write_str("(")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", arg)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// A malformed type declaration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to parse type {input:?} at position {position}: {message}")]
pub struct ParseError {
    /// What went wrong
    pub message: String,
    /// Byte offset into `input` where parsing failed
    pub position: usize,
    /// The full text being parsed
    pub input: String,
}

/// Parses a type declaration into a [`TypeNode`] tree.
///
/// # Examples
///
/// ```
/// use clickhttp::types::parse;
///
/// let node = parse("Array(Tuple(String, UInt64))").unwrap();
/// assert_eq!(node.name, "Array");
/// assert_eq!(node.args[0].name, "Tuple");
/// assert_eq!(node.args[0].args.len(), 2);
///
/// assert!(parse("Array(String").is_err());
/// ```
pub fn parse(input: &str) -> Result<TypeNode, ParseError> {
    let mut parser = Parser { input, pos: 0 };
    let node = parser.parse_type()?;
    parser.skip_whitespace();
    if parser.pos < input.len() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(node)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            position: self.pos,
            input: self.input.to_string(),
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), ParseError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    fn parse_type(&mut self) -> Result<TypeNode, ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some('\'') => self.parse_string_literal(),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let digits = self.parse_number()?;
                Ok(TypeNode::simple(digits))
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.parse_identifier_type(),
            Some(c) => Err(self.error(format!("unexpected character '{}'", c))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_identifier_type(&mut self) -> Result<TypeNode, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        let name = &self.input[start..self.pos];

        self.skip_whitespace();
        if self.peek() != Some('(') {
            return Ok(TypeNode::simple(name));
        }
        self.bump();

        let named = name == "Tuple";
        let mut args = vec![self.parse_argument(named)?];
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.bump();
                    args.push(self.parse_argument(named)?);
                }
                Some(')') => {
                    self.bump();
                    break;
                }
                Some(c) => {
                    return Err(self.error(format!("expected ',' or ')', found '{}'", c)))
                }
                None => return Err(self.error(format!("unclosed '(' after {}", name))),
            }
        }

        Ok(TypeNode::with_args(name, args))
    }

    fn parse_argument(&mut self, named: bool) -> Result<TypeNode, ParseError> {
        let node = self.parse_type()?;
        if !named || !node.args.is_empty() || !starts_identifier(&node.name) {
            return Ok(node);
        }

        self.skip_whitespace();
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut element = self.parse_type()?;
                element.field = Some(node.name);
                Ok(element)
            }
            _ => Ok(node),
        }
    }

    fn parse_string_literal(&mut self) -> Result<TypeNode, ParseError> {
        let start = self.pos;
        self.expect('\'')?;
        loop {
            match self.bump() {
                Some('\\') => {
                    if self.bump().is_none() {
                        return Err(self.error("unterminated string literal"));
                    }
                }
                Some('\'') => break,
                Some(_) => {}
                None => return Err(self.error("unterminated string literal")),
            }
        }
        let mut node = TypeNode::simple(&self.input[start..self.pos]);

        self.skip_whitespace();
        if self.peek() == Some('=') {
            self.bump();
            self.skip_whitespace();
            let digits = self.parse_number()?;
            let value = digits
                .parse::<i64>()
                .map_err(|e| self.error(format!("invalid enum value {}: {}", digits, e)))?;
            node.value = Some(value);
        }

        Ok(node)
    }

    fn parse_number(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        if self.pos == digits_start {
            return Err(self.error("expected digits"));
        }
        Ok(self.input[start..self.pos].to_string())
    }
}

fn starts_identifier(text: &str) -> bool {
    matches!(text.chars().next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
}
