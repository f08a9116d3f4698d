//! Property bundles and constraint filters
//!
//! Demands and offers describe themselves with flat, dotted property names
//! (`golem.runtime.name`) and restrict their counterparts with an LDAP-style
//! filter:
//!
//! ```text
//! (&(golem.com.pricing.model=linear)
//!   (golem.srv.caps.multi-activity=true)
//!   (golem.runtime.name=wasmtime))
//! ```
//!
//! Supported operators: `&`, `|`, `!`, `=`, `<`, `>`, `<=`, `>=`, and the
//! presence test `(name=*)`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MarketError, Result};

/// Well-known property names
pub mod names {
    pub const RUNTIME_NAME: &str = "golem.runtime.name";
    pub const PRICING_MODEL: &str = "golem.com.pricing.model";
    pub const MULTI_ACTIVITY: &str = "golem.srv.caps.multi-activity";
    pub const NODE_NAME: &str = "golem.node.id.name";
}

/// Flat property bundle keyed by dotted names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    /// Whether the bundle declares the multi-activity capability
    pub fn multi_activity(&self) -> bool {
        self.get_bool(names::MULTI_ACTIVITY).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Constraint AST
// ============================================================================

/// Comparison operator inside a constraint item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// Parsed constraint expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// Matches everything (empty filter)
    Any,
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
    Not(Box<Constraint>),
    Present(String),
    Compare {
        name: String,
        op: CompareOp,
        value: String,
    },
}

impl Constraint {
    /// Parse a filter string. Blank input yields [`Constraint::Any`].
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = Parser {
            src: input.as_bytes(),
            pos: 0,
            depth: 0,
        };
        parser.skip_ws();
        if parser.at_end() {
            return Ok(Constraint::Any);
        }
        let constraint = parser.filter()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("trailing input after filter"));
        }
        Ok(constraint)
    }

    /// Evaluate the constraint against a counterpart's properties
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Self::Any => true,
            Self::And(items) => items.iter().all(|c| c.matches(props)),
            Self::Or(items) => items.iter().any(|c| c.matches(props)),
            Self::Not(inner) => !inner.matches(props),
            Self::Present(name) => props.get(name).is_some(),
            Self::Compare { name, op, value } => match props.get(name) {
                Some(actual) => compare(actual, *op, value),
                None => false,
            },
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => Ok(()),
            Self::And(items) => {
                f.write_str("(&")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Self::Or(items) => {
                f.write_str("(|")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Self::Not(inner) => write!(f, "(!{})", inner),
            Self::Present(name) => write!(f, "({}=*)", name),
            Self::Compare { name, op, value } => write!(f, "({}{}{})", name, op, value),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &str) -> bool {
    use std::cmp::Ordering;

    let ordering = match actual {
        Value::Bool(b) => match expected.parse::<bool>() {
            Ok(e) => b.cmp(&e),
            Err(_) => return false,
        },
        Value::Number(n) => match (n.as_f64(), expected.parse::<f64>()) {
            (Some(a), Ok(e)) => match a.partial_cmp(&e) {
                Some(o) => o,
                None => return false,
            },
            _ => return false,
        },
        Value::String(s) => s.as_str().cmp(expected),
        Value::Array(items) => {
            // A list property matches equality when any element does.
            return op == CompareOp::Eq && items.iter().any(|v| compare(v, op, expected));
        }
        _ => return false,
    };

    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Deepest filter nesting accepted from a counterpart
pub const MAX_CONSTRAINT_DEPTH: usize = 64;

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, reason: &str) -> MarketError {
        MarketError::InvalidConstraint {
            offset: self.pos,
            reason: reason.to_string(),
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn filter(&mut self) -> Result<Constraint> {
        self.expect(b'(')?;
        if self.depth == MAX_CONSTRAINT_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let constraint = self.filter_body();
        self.depth -= 1;
        constraint
    }

    fn filter_body(&mut self) -> Result<Constraint> {
        self.skip_ws();
        let constraint = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Constraint::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Constraint::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Constraint::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end of input")),
        };
        self.expect(b')')?;
        Ok(constraint)
    }

    fn filter_list(&mut self) -> Result<Vec<Constraint>> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'(') => items.push(self.filter()?),
                _ => break,
            }
        }
        if items.is_empty() {
            return Err(self.error("operator requires at least one filter"));
        }
        Ok(items)
    }

    fn item(&mut self) -> Result<Constraint> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !matches!(c, b'=' | b'<' | b'>' | b'(' | b')')) {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).trim().to_string();
        if name.is_empty() {
            return Err(self.error("missing property name"));
        }

        let op = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                CompareOp::Eq
            }
            Some(b'<') => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    CompareOp::Le
                } else {
                    CompareOp::Lt
                }
            }
            Some(b'>') => {
                self.pos += 1;
                if self.peek() == Some(b'=') {
                    self.pos += 1;
                    CompareOp::Ge
                } else {
                    CompareOp::Gt
                }
            }
            _ => return Err(self.error("expected comparison operator")),
        };

        let start = self.pos;
        while matches!(self.peek(), Some(c) if c != b')') {
            self.pos += 1;
        }
        let value = String::from_utf8_lossy(&self.src[start..self.pos]).trim().to_string();

        if op == CompareOp::Eq && value == "*" {
            return Ok(Constraint::Present(name));
        }
        Ok(Constraint::Compare { name, op, value })
    }
}
