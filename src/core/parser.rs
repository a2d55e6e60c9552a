//! CV-003: Configuration language parsing and formatting.
//!
//! Block syntax:
//!
//! ```text
//! param "name" { default = "value" }
//! task "id"    { check = "script"; apply = "script"; depends = ["task.other"] }
//! module "./child.hcl" "name" { arg = "value" }
//! ```
//!
//! Syntax errors are fatal for the file. Structural problems (wrong
//! number of block keys, duplicate attributes) accumulate so that every
//! one of them is reported at once.

use super::error::{Diagnostic, Diagnostics, Error, Position, Result};
use super::types::{Node, Value};
use indexmap::IndexMap;
use std::fmt::Write as _;

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Eq,
    Comma,
    Semi,
    Newline,
    Eof,
}

impl std::fmt::Display for Tok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "{}", s),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Num(n) => write!(f, "{}", n),
            Self::LBrace => write!(f, "'{{'"),
            Self::RBrace => write!(f, "'}}'"),
            Self::LBracket => write!(f, "'['"),
            Self::RBracket => write!(f, "']'"),
            Self::Eq => write!(f, "'='"),
            Self::Comma => write!(f, "','"),
            Self::Semi => write!(f, "';'"),
            Self::Newline => write!(f, "newline"),
            Self::Eof => write!(f, "end of file"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

struct Lexer<'s> {
    file: &'s str,
    chars: Vec<char>,
    i: usize,
    line: usize,
    column: usize,
}

impl<'s> Lexer<'s> {
    fn new(file: &'s str, text: &str) -> Self {
        Self {
            file,
            chars: text.chars().collect(),
            i: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.i).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.i + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.i).copied()?;
        self.i += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, message: impl Into<String>) -> Error {
        Error::Parse {
            pos: Position::new(self.file, line, column),
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    tok: Tok::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };
            let tok = match c {
                '\n' => {
                    self.bump();
                    Tok::Newline
                }
                '{' | '}' | '[' | ']' | '=' | ',' | ';' => {
                    self.bump();
                    match c {
                        '{' => Tok::LBrace,
                        '}' => Tok::RBrace,
                        '[' => Tok::LBracket,
                        ']' => Tok::RBracket,
                        '=' => Tok::Eq,
                        ',' => Tok::Comma,
                        _ => Tok::Semi,
                    }
                }
                '"' => Tok::Str(self.string()?),
                '<' if self.peek_at(1) == Some('<') => Tok::Str(self.heredoc()?),
                c if c.is_ascii_digit()
                    || (c == '-' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) =>
                {
                    self.number()?
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                            ident.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    Tok::Ident(ident)
                }
                other => return Err(self.error(line, column, format!("unexpected character {:?}", other))),
            };
            tokens.push(Token { tok, line, column });
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.bump();
                }
                Some('#') => self.skip_line(),
                Some('/') if self.peek_at(1) == Some('/') => self.skip_line(),
                Some('/') if self.peek_at(1) == Some('*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.error(line, column, "unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    /// Whether `}}` follows before the end of the current line.
    fn template_closes_on_line(&self) -> bool {
        self.chars[self.i..]
            .iter()
            .take_while(|&&c| c != '\n')
            .collect::<String>()
            .contains("}}")
    }

    fn string(&mut self) -> Result<String> {
        let (line, column) = (self.line, self.column);
        self.bump();
        let mut out = String::new();
        // quotes inside `{{ }}` belong to the template when it closes on this line
        let mut in_template = false;
        loop {
            match self.bump() {
                Some('"') if in_template && self.template_closes_on_line() => out.push('"'),
                Some('"') => return Ok(out),
                Some('{') if self.peek() == Some('{') => {
                    self.bump();
                    out.push_str("{{");
                    in_template = true;
                }
                Some('}') if in_template && self.peek() == Some('}') => {
                    self.bump();
                    out.push_str("}}");
                    in_template = false;
                }
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => break,
                },
                Some('\n') | None => break,
                Some(c) => out.push(c),
            }
        }
        Err(self.error(line, column, "unterminated string"))
    }

    /// `<<MARKER` or indentation-stripping `<<-MARKER`, body up to a line holding only the marker.
    fn heredoc(&mut self) -> Result<String> {
        let (line, column) = (self.line, self.column);
        self.bump();
        self.bump();
        let strip = if self.peek() == Some('-') {
            self.bump();
            true
        } else {
            false
        };
        let mut marker = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                marker.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if marker.is_empty() {
            return Err(self.error(line, column, "heredoc needs a marker"));
        }
        while matches!(self.peek(), Some(' ' | '\t' | '\r')) {
            self.bump();
        }
        if self.bump() != Some('\n') {
            return Err(self.error(line, column, "heredoc marker must end the line"));
        }

        let mut lines = Vec::new();
        loop {
            if self.peek().is_none() {
                return Err(self.error(line, column, format!("unterminated heredoc {}", marker)));
            }
            let mut current = String::new();
            while let Some(c) = self.peek() {
                if c == '\n' {
                    break;
                }
                current.push(c);
                self.bump();
            }
            if current.trim() == marker {
                break;
            }
            self.bump();
            lines.push(current.trim_end_matches('\r').to_string());
        }

        if strip {
            let indent = lines
                .iter()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.len() - l.trim_start().len())
                .min()
                .unwrap_or(0);
            for l in &mut lines {
                *l = l.get(indent..).unwrap_or("").to_string();
            }
        }
        let mut body = lines.join("\n");
        body.push('\n');
        Ok(body)
    }

    fn number(&mut self) -> Result<Tok> {
        let (line, column) = (self.line, self.column);
        let mut text = String::new();
        if self.peek() == Some('-') {
            text.push('-');
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E') {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(Tok::Num)
            .map_err(|_| self.error(line, column, format!("invalid number {:?}", text)))
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'s> {
    file: &'s str,
    tokens: Vec<Token>,
    at: usize,
    diagnostics: Diagnostics,
}

impl<'s> Parser<'s> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.at.min(self.tokens.len() - 1)].tok
    }

    fn position(&self) -> Position {
        let t = &self.tokens[self.at.min(self.tokens.len() - 1)];
        Position::new(self.file, t.line, t.column)
    }

    fn next(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.at < self.tokens.len() - 1 {
            self.at += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> Error {
        error_at(self.position(), message)
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Tok::Newline | Tok::Semi | Tok::Comma) {
            self.next();
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.next();
        }
    }

    fn expect(&mut self, want: Tok) -> Result<()> {
        if *self.peek() == want {
            self.next();
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {}", want, self.peek())))
        }
    }

    fn diagnose(&mut self, pos: Position, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(pos, message));
    }

    fn parse_file(&mut self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        loop {
            self.skip_separators();
            if *self.peek() == Tok::Eof {
                return Ok(nodes);
            }
            if let Some(node) = self.parse_item()? {
                nodes.push(node);
            }
        }
    }

    fn parse_item(&mut self) -> Result<Option<Node>> {
        let pos = self.position();
        let mut keys = Vec::new();
        loop {
            match self.peek().clone() {
                Tok::LBrace => break,
                Tok::Ident(k) | Tok::Str(k) => {
                    self.next();
                    keys.push(k);
                }
                other => return Err(self.error(format!("expected block key or '{{', found {}", other))),
            }
        }
        self.expect(Tok::LBrace)?;
        let attrs = self.parse_body()?;

        let is_module = keys.first().is_some_and(|k| k == "module");
        let problem = match keys.len() {
            0 => Some("no keys".to_string()),
            1 => Some("missing name".to_string()),
            2 if is_module => Some("module needs a source and a name".to_string()),
            2 => None,
            3 if is_module => None,
            _ => Some("too many keys".to_string()),
        };
        if let Some(problem) = problem {
            let label = keys.first().map(|k| format!("{}: ", k)).unwrap_or_default();
            self.diagnose(pos, format!("{}{}", label, problem));
            return Ok(None);
        }

        let mut keys = keys.into_iter();
        let kind = keys.next().unwrap_or_default();
        let (source, name) = if is_module {
            (keys.next(), keys.next().unwrap_or_default())
        } else {
            (None, keys.next().unwrap_or_default())
        };
        Ok(Some(Node {
            kind,
            name,
            source,
            attrs,
            pos,
        }))
    }

    /// Attributes and nested blocks up to and including the closing brace.
    fn parse_body(&mut self) -> Result<IndexMap<String, Value>> {
        let mut attrs: IndexMap<String, Value> = IndexMap::new();
        loop {
            self.skip_separators();
            let pos = self.position();
            match self.next() {
                Tok::RBrace => return Ok(attrs),
                Tok::Eof => return Err(self.error("unclosed block")),
                Tok::Ident(name) | Tok::Str(name) => {
                    if *self.peek() == Tok::Eq {
                        self.next();
                        let value = self.parse_expr()?;
                        if attrs.contains_key(&name) {
                            self.diagnose(pos, format!("duplicate attribute {:?}", name));
                        } else {
                            attrs.insert(name, value);
                        }
                    } else {
                        let block = self.parse_nested_block()?;
                        match attrs.get_mut(&name) {
                            None => {
                                attrs.insert(name, block);
                            }
                            Some(Value::List(items)) => items.push(block),
                            Some(existing) => {
                                let first = std::mem::replace(existing, Value::List(Vec::new()));
                                *existing = Value::List(vec![first, block]);
                            }
                        }
                    }
                }
                other => return Err(error_at(pos, format!("expected attribute name, found {}", other))),
            }
        }
    }

    /// `name "label" { ... }` inside a block; labels nest as objects.
    fn parse_nested_block(&mut self) -> Result<Value> {
        let mut labels = Vec::new();
        while let Tok::Str(label) | Tok::Ident(label) = self.peek().clone() {
            self.next();
            labels.push(label);
        }
        self.expect(Tok::LBrace)?;
        let mut value = Value::Object(self.parse_body()?);
        for label in labels.into_iter().rev() {
            let mut wrapper = IndexMap::new();
            wrapper.insert(label, value);
            value = Value::Object(wrapper);
        }
        Ok(value)
    }

    fn parse_expr(&mut self) -> Result<Value> {
        let pos = self.position();
        match self.next() {
            Tok::Str(s) => Ok(Value::String(s)),
            Tok::Num(n) => Ok(Value::Number(n)),
            Tok::Ident(word) => Ok(match word.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(word),
            }),
            Tok::LBracket => {
                let mut items = Vec::new();
                loop {
                    while matches!(self.peek(), Tok::Newline | Tok::Comma) {
                        self.next();
                    }
                    if *self.peek() == Tok::RBracket {
                        self.next();
                        return Ok(Value::List(items));
                    }
                    if *self.peek() == Tok::Eof {
                        return Err(self.error("unclosed list"));
                    }
                    items.push(self.parse_expr()?);
                }
            }
            Tok::LBrace => {
                let mut map = IndexMap::new();
                loop {
                    self.skip_separators();
                    let pos = self.position();
                    match self.next() {
                        Tok::RBrace => return Ok(Value::Object(map)),
                        Tok::Ident(key) | Tok::Str(key) => {
                            self.skip_newlines();
                            self.expect(Tok::Eq)?;
                            let value = self.parse_expr()?;
                            if map.contains_key(&key) {
                                self.diagnose(pos, format!("duplicate attribute {:?}", key));
                            } else {
                                map.insert(key, value);
                            }
                        }
                        Tok::Eof => return Err(self.error("unclosed object")),
                        other => return Err(error_at(pos, format!("expected object key, found {}", other))),
                    }
                }
            }
            other => Err(error_at(pos, format!("expected a value, found {}", other))),
        }
    }
}

fn error_at(pos: Position, message: impl Into<String>) -> Error {
    Error::Parse {
        pos,
        message: message.into(),
    }
}

/// Parse `text` into nodes plus the structural diagnostics found along the way.
pub fn parse_with_diagnostics(file: &str, text: &str) -> Result<(Vec<Node>, Diagnostics)> {
    let tokens = Lexer::new(file, text).tokenize()?;
    let mut parser = Parser {
        file,
        tokens,
        at: 0,
        diagnostics: Diagnostics::new(),
    };
    let nodes = parser.parse_file()?;
    Ok((nodes, parser.diagnostics))
}

/// Parse configuration text into one node per top-level block.
pub fn parse(file: &str, text: &str) -> Result<Vec<Node>> {
    let (nodes, diagnostics) = parse_with_diagnostics(file, text)?;
    diagnostics.into_result()?;
    Ok(nodes)
}

// ============================================================================
// Formatter
// ============================================================================

/// Re-emit nodes in canonical layout. Comments are not preserved.
pub fn format_nodes(nodes: &[Node]) -> String {
    let mut out = String::new();
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&node.kind);
        if let Some(source) = &node.source {
            let _ = write!(out, " {}", quote(source));
        }
        let _ = write!(out, " {}", quote(&node.name));
        if node.attrs.is_empty() {
            out.push_str(" {}\n");
            continue;
        }
        out.push_str(" {\n");
        write_attrs(&mut out, &node.attrs, 1);
        out.push_str("}\n");
    }
    out
}

fn write_attrs(out: &mut String, attrs: &IndexMap<String, Value>, depth: usize) {
    let indent = "  ".repeat(depth);
    for (key, value) in attrs {
        let _ = write!(out, "{}{} = ", indent, format_key(key));
        write_value(out, value, depth);
        out.push('\n');
    }
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::String(s) if s.ends_with('\n') && s.len() > 1 && !s.lines().any(|l| l.trim() == "EOF") => {
            out.push_str("<<EOF\n");
            out.push_str(s);
            out.push_str("EOF");
        }
        Value::String(s) => out.push_str(&quote(s)),
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item, depth);
            }
            out.push(']');
        }
        Value::Object(map) if map.is_empty() => out.push_str("{}"),
        Value::Object(map) => {
            out.push_str("{\n");
            write_attrs(out, map, depth + 1);
            out.push_str(&"  ".repeat(depth));
            out.push('}');
        }
        other => out.push_str(&other.to_text()),
    }
}

fn format_key(key: &str) -> String {
    let bare = key
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && key.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if bare {
        key.to_string()
    } else {
        quote(key)
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
