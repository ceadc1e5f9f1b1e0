//! `terraform.tfvars` rendering and parsing
//!
//! Variables are any `Serialize` value that maps to a JSON object. Each top
//! level field becomes one `name = value` line; nested maps become HCL
//! object literals. Keys are emitted in sorted order, so the same value
//! always renders to the same bytes. That matters because an existing
//! variables file is compared byte for byte before it is reused.
//!
//! The parser accepts the subset the renderer produces plus comments and
//! `:` as an object separator, which is enough to read back files written
//! by hand or by older versions.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use constellation_common::Error;

/// Errors from rendering or parsing variables files
#[derive(Debug, Error)]
pub enum TfvarsError {
    /// The value is not a JSON object at the top level
    #[error("variables must be a map of names to values")]
    NotAnObject,

    /// The value could not be converted to JSON
    #[error("serializing variables: {0}")]
    Serialize(String),

    /// The input is not valid HCL
    #[error("line {line}, column {column}: {message}")]
    Parse {
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// What was expected
        message: String,
    },

    /// The parsed values do not fit the target type
    #[error("decoding variables: {0}")]
    Decode(String),
}

impl From<TfvarsError> for Error {
    fn from(e: TfvarsError) -> Self {
        Error::malformed("terraform variables", e.to_string())
    }
}

/// Render `vars` as a tfvars file
pub fn render<T: Serialize>(vars: &T) -> Result<String, TfvarsError> {
    let value = serde_json::to_value(vars).map_err(|e| TfvarsError::Serialize(e.to_string()))?;
    render_value(&value)
}

/// Render a JSON object as a tfvars file; `null` fields are omitted
pub fn render_value(value: &Value) -> Result<String, TfvarsError> {
    let map = value.as_object().ok_or(TfvarsError::NotAnObject)?;
    let mut out = String::new();
    for (key, v) in sorted(map) {
        if v.is_null() {
            continue;
        }
        out.push_str(&render_key(key));
        out.push_str(" = ");
        write_value(&mut out, v, 0);
        out.push('\n');
    }
    Ok(out)
}

/// Parse a tfvars file into a JSON object
pub fn parse(input: &str) -> Result<Value, TfvarsError> {
    let mut parser = Parser::new(input);
    let mut map = Map::new();
    loop {
        parser.skip_trivia();
        if parser.at_end() {
            break;
        }
        let key = parser.key()?;
        parser.skip_trivia();
        parser.expect('=')?;
        let value = parser.value()?;
        map.insert(key, value);
    }
    Ok(Value::Object(map))
}

/// Parse a tfvars file into `T`
pub fn from_str<T: DeserializeOwned>(input: &str) -> Result<T, TfvarsError> {
    serde_json::from_value(parse(input)?).map_err(|e| TfvarsError::Decode(e.to_string()))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !matches!(s, "true" | "false" | "null")
}

fn render_key(key: &str) -> String {
    if is_identifier(key) {
        key.to_string()
    } else {
        quote(key)
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Template sequences must not be interpreted
            '$' | '%' if chars.peek() == Some(&'{') => {
                out.push(c);
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn write_value(out: &mut String, value: &Value, indent: usize) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&quote(s)),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item, indent);
            }
            out.push(']');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{\n");
            for (key, v) in sorted(map) {
                push_indent(out, indent + 1);
                out.push_str(&render_key(key));
                out.push_str(" = ");
                write_value(out, v, indent + 1);
                out.push('\n');
            }
            push_indent(out, indent);
            out.push('}');
        }
    }
}

fn sorted(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn push_indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("  ");
    }
}

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> TfvarsError {
        TfvarsError::Parse {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => self.skip_line(),
                Some('/') if self.peek_at(1) == Some('/') => self.skip_line(),
                _ => break,
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    fn expect(&mut self, want: char) -> Result<(), TfvarsError> {
        match self.peek() {
            Some(c) if c == want => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", want, c))),
            None => Err(self.error(format!("expected '{}', found end of input", want))),
        }
    }

    fn identifier(&mut self) -> Result<String, TfvarsError> {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if ident.is_empty() {
            return Err(self.error("expected an identifier"));
        }
        Ok(ident)
    }

    fn key(&mut self) -> Result<String, TfvarsError> {
        if self.peek() == Some('"') {
            self.string()
        } else {
            self.identifier()
        }
    }

    fn value(&mut self) -> Result<Value, TfvarsError> {
        self.skip_trivia();
        match self.peek() {
            Some('"') => Ok(Value::String(self.string()?)),
            Some('[') => self.list(),
            Some('{') => self.object(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => match self.identifier()?.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                other => Err(self.error(format!("unexpected identifier {:?}", other))),
            },
            Some(c) => Err(self.error(format!("unexpected character '{}'", c))),
            None => Err(self.error("expected a value, found end of input")),
        }
    }

    fn string(&mut self) -> Result<String, TfvarsError> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            let c = self
                .bump()
                .ok_or_else(|| self.error("unterminated string"))?;
            match c {
                '"' => return Ok(out),
                '\\' => {
                    let escaped = self
                        .bump()
                        .ok_or_else(|| self.error("unterminated escape"))?;
                    match escaped {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        'n' => out.push('\n'),
                        'r' => out.push('\r'),
                        't' => out.push('\t'),
                        'u' => {
                            let mut code = String::new();
                            for _ in 0..4 {
                                code.push(
                                    self.bump()
                                        .ok_or_else(|| self.error("short unicode escape"))?,
                                );
                            }
                            let decoded = u32::from_str_radix(&code, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("invalid unicode escape"))?;
                            out.push(decoded);
                        }
                        other => {
                            return Err(self.error(format!("unknown escape '\\{}'", other)))
                        }
                    }
                }
                '$' | '%' if self.peek() == Some(c) && self.peek_at(1) == Some('{') => {
                    self.bump();
                    out.push(c);
                }
                '$' | '%' if self.peek() == Some('{') => {
                    return Err(self.error("template expressions are not supported"));
                }
                '\n' => return Err(self.error("newline in string")),
                c => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Value, TfvarsError> {
        let mut raw = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                raw.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let number = if raw.contains(['.', 'e', 'E']) {
            raw.parse::<f64>().ok().and_then(Number::from_f64)
        } else if raw.starts_with('-') {
            raw.parse::<i64>().ok().map(Number::from)
        } else {
            raw.parse::<u64>().ok().map(Number::from)
        };
        number
            .map(Value::Number)
            .ok_or_else(|| self.error(format!("invalid number {:?}", raw)))
    }

    fn list(&mut self) -> Result<Value, TfvarsError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(']') {
                self.bump();
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_trivia();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {}
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn object(&mut self) -> Result<Value, TfvarsError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Object(map));
            }
            let key = self.key()?;
            self.skip_trivia();
            match self.peek() {
                Some('=') | Some(':') => {
                    self.bump();
                }
                _ => return Err(self.error("expected '=' or ':'")),
            }
            let value = self.value()?;
            map.insert(key, value);
            self.skip_trivia();
            if self.peek() == Some(',') {
                self.bump();
            }
        }
    }
}
