//! Generic `name(arg, ...)` line codec.
//!
//! Grammar (one line, newline already stripped):
//!
//! ```text
//! line := name "(" [ arg { ", " arg } ] ")"
//! name := [a-z0-9_]+
//! arg  := "nil" | '"' <any chars except '"'> '"'
//! ```
//!
//! There is no escaping inside strings; a string simply cannot contain `"`.

use std::fmt;

use thiserror::Error;

/// Errors produced while parsing a protocol line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("invalid message name: {0:?}")]
    InvalidName(String),

    #[error("missing '(' after message name")]
    MissingOpenParen,

    #[error("expected nil or a quoted string at: {0:?}")]
    ExpectedArgument(String),

    #[error("unterminated string argument")]
    UnterminatedString,

    #[error("expected ', ' or ')' at: {0:?}")]
    ExpectedSeparator(String),

    #[error("trailing data after ')': {0:?}")]
    TrailingData(String),
}

/// One protocol line: a name and its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    name: String,
    args: Vec<Option<String>>,
}

impl Line {
    /// Creates a line with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Creates a line from a full argument list.
    pub fn with_args(name: impl Into<String>, args: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().map(|a| a.map(sanitize)).collect(),
        }
    }

    /// Appends a string argument.
    #[must_use]
    pub fn string(mut self, value: impl Into<String>) -> Self {
        self.args.push(Some(sanitize(value.into())));
        self
    }

    /// Appends an optional argument (`nil` when absent).
    #[must_use]
    pub fn optional<S: Into<String>>(mut self, value: Option<S>) -> Self {
        self.args.push(value.map(|v| sanitize(v.into())));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Option<String>] {
        &self.args
    }

    pub fn into_parts(self) -> (String, Vec<Option<String>>) {
        (self.name, self.args)
    }

    /// Wire form including the trailing newline.
    pub fn to_wire(&self) -> String {
        let mut out = self.to_string();
        out.push('\n');
        out
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match arg {
                Some(value) => write!(f, "\"{value}\"")?,
                None => f.write_str("nil")?,
            }
        }
        f.write_str(")")
    }
}

/// Replaces characters the grammar cannot carry so that every formatted line
/// parses back.
fn sanitize(value: String) -> String {
    if value.contains(['"', '\n', '\r']) {
        value.replace(['"', '\n', '\r'], "_")
    } else {
        value
    }
}

/// Parses one line (without its trailing newline).
pub fn parse_line(input: &str) -> Result<Line, ParseError> {
    if input.is_empty() {
        return Err(ParseError::Empty);
    }

    let (name, rest) = input
        .split_once('(')
        .ok_or(ParseError::MissingOpenParen)?;

    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(ParseError::InvalidName(name.to_string()));
    }

    let mut args = Vec::new();

    if let Some(after) = rest.strip_prefix(')') {
        return finish(name, args, after);
    }

    let mut rest = rest;
    loop {
        let (arg, after) = parse_arg(rest)?;
        args.push(arg);

        if let Some(next) = after.strip_prefix(", ") {
            rest = next;
        } else if let Some(tail) = after.strip_prefix(')') {
            return finish(name, args, tail);
        } else {
            return Err(ParseError::ExpectedSeparator(after.to_string()));
        }
    }
}

fn finish(name: &str, args: Vec<Option<String>>, tail: &str) -> Result<Line, ParseError> {
    if !tail.is_empty() {
        return Err(ParseError::TrailingData(tail.to_string()));
    }
    Ok(Line {
        name: name.to_string(),
        args,
    })
}

fn parse_arg(input: &str) -> Result<(Option<String>, &str), ParseError> {
    if let Some(after) = input.strip_prefix("nil") {
        return Ok((None, after));
    }

    if let Some(body) = input.strip_prefix('"') {
        let (value, after) = body.split_once('"').ok_or(ParseError::UnterminatedString)?;
        return Ok((Some(value.to_string()), after));
    }

    Err(ParseError::ExpectedArgument(input.to_string()))
}
