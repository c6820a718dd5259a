//! Lossless S-expression reader and writer.
//!
//! Every parsed node remembers the whitespace in front of it, atoms keep
//! their exact source spelling and lists keep the whitespace before their
//! closing parenthesis. Writing an untouched tree therefore reproduces the
//! input byte for byte. Nodes built in code carry no trivia and are laid out
//! in KiCad 8 style when written.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("Unexpected token: {0}")]
    UnexpectedToken(String),
    /// Byte offset into the input and a description.
    #[error("Parse error at byte {0}: {1}")]
    ParseError(usize, String),
}

/// A leaf value. `raw` holds the exact source text (quotes and escapes
/// included) until the value is changed.
#[derive(Debug, Clone)]
pub struct Atom {
    value: String,
    quoted: bool,
    raw: Option<String>,
    leading: Option<String>,
}

#[derive(Debug, Clone)]
pub struct List {
    items: Vec<SExp>,
    leading: Option<String>,
    closing: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SExp {
    Atom(Atom),
    List(List),
}

impl PartialEq for SExp {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SExp::Atom(a), SExp::Atom(b)) => a.value == b.value,
            (SExp::List(a), SExp::List(b)) => a.items == b.items,
            _ => false,
        }
    }
}

impl SExp {
    /// Unquoted symbol such as `yes` or `passive`.
    pub fn symbol(value: impl Into<String>) -> Self {
        SExp::Atom(Atom {
            value: value.into(),
            quoted: false,
            raw: None,
            leading: None,
        })
    }

    /// Quoted string atom.
    pub fn string(value: impl Into<String>) -> Self {
        SExp::Atom(Atom {
            value: value.into(),
            quoted: true,
            raw: None,
            leading: None,
        })
    }

    pub fn number(value: f64) -> Self {
        SExp::symbol(format_number(value))
    }

    pub fn list(items: Vec<SExp>) -> Self {
        SExp::List(List {
            items,
            leading: None,
            closing: None,
        })
    }

    /// `(key item...)`
    pub fn tagged(key: &str, rest: Vec<SExp>) -> Self {
        let mut items = Vec::with_capacity(rest.len() + 1);
        items.push(SExp::symbol(key));
        items.extend(rest);
        SExp::list(items)
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            SExp::Atom(atom) => Some(&atom.value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        self.as_atom().and_then(|s| s.parse::<f64>().ok())
    }

    pub fn as_list(&self) -> Option<&[SExp]> {
        match self {
            SExp::List(list) => Some(&list.items),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<SExp>> {
        match self {
            SExp::List(list) => Some(&mut list.items),
            _ => None,
        }
    }

    /// Head symbol of a list, e.g. `wire` for `(wire ...)`.
    pub fn tag(&self) -> Option<&str> {
        self.as_list()?.first()?.as_atom()
    }

    /// Atom at `index` of a list.
    pub fn atom_at(&self, index: usize) -> Option<&str> {
        self.as_list()?.get(index)?.as_atom()
    }

    pub fn number_at(&self, index: usize) -> Option<f64> {
        self.as_list()?.get(index)?.as_number()
    }

    /// First child list whose head is `key`.
    pub fn find(&self, key: &str) -> Option<&SExp> {
        self.as_list()?.iter().find(|item| item.tag() == Some(key))
    }

    pub fn find_mut(&mut self, key: &str) -> Option<&mut SExp> {
        self.as_list_mut()?
            .iter_mut()
            .find(|item| item.tag() == Some(key))
    }

    /// All child lists whose head is `key`.
    pub fn get_all(&self, key: &str) -> Vec<&SExp> {
        match self.as_list() {
            Some(items) => items.iter().filter(|item| item.tag() == Some(key)).collect(),
            None => Vec::new(),
        }
    }

    /// Second atom of the first `(key value ...)` child.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.find(key)?.atom_at(1)
    }

    /// True when the list contains the bare symbol `flag`, e.g. `hide`.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.as_list()
            .map(|items| items.iter().skip(1).any(|item| item.as_atom() == Some(flag)))
            .unwrap_or(false)
    }

    /// Replace the atom at `index` when its value differs. The replacement
    /// keeps the quoting style of the atom it replaces.
    pub fn set_atom(&mut self, index: usize, value: &str) {
        if let Some(SExp::Atom(atom)) = self.as_list_mut().and_then(|items| items.get_mut(index)) {
            if atom.value != value {
                atom.value = value.to_string();
                atom.raw = None;
            }
        }
    }

    /// Replace a numeric atom when the numbers differ; an atom spelled
    /// `101.60` stays untouched when set to `101.6`.
    pub fn set_number(&mut self, index: usize, value: f64) {
        let Some(items) = self.as_list_mut() else {
            return;
        };
        let len = items.len();
        match items.get_mut(index) {
            Some(SExp::Atom(atom)) => {
                let same = atom
                    .value
                    .parse::<f64>()
                    .map(|current| (current - value).abs() < 1e-9)
                    .unwrap_or(false);
                if !same {
                    atom.value = format_number(value);
                    atom.quoted = false;
                    atom.raw = None;
                }
            }
            Some(_) => {}
            None if index == len => items.push(SExp::number(value)),
            None => {}
        }
    }

    /// Set the value of `(key value)`, appending the child when missing.
    pub fn set_value(&mut self, key: &str, value: SExp) {
        if let Some(child) = self.find_mut(key) {
            if let Some(items) = child.as_list_mut() {
                match items.get_mut(1) {
                    Some(SExp::Atom(atom)) => {
                        if let Some(new_value) = value.as_atom() {
                            if atom.value != new_value {
                                atom.value = new_value.to_string();
                                atom.raw = None;
                            }
                        }
                    }
                    _ => items.insert(1.min(items.len()), value),
                }
            }
            return;
        }
        self.push(SExp::tagged(key, vec![value]));
    }

    /// Insert `node` right after the last child tagged `after`, or before the
    /// first child tagged with one of `before`, or at the end.
    pub fn insert_near(&mut self, node: SExp, after: &str, before: &[&str]) {
        let Some(items) = self.as_list_mut() else {
            return;
        };
        let position = items
            .iter()
            .rposition(|item| item.tag() == Some(after))
            .map(|i| i + 1)
            .or_else(|| {
                items
                    .iter()
                    .position(|item| item.tag().map(|t| before.contains(&t)).unwrap_or(false))
            })
            .unwrap_or(items.len());
        items.insert(position, node);
    }

    pub fn push(&mut self, node: SExp) {
        if let Some(items) = self.as_list_mut() {
            items.push(node);
        }
    }

    /// Remove every child tagged `key`; returns how many were removed.
    pub fn remove_all(&mut self, key: &str) -> usize {
        match self.as_list_mut() {
            Some(items) => {
                let before = items.len();
                items.retain(|item| item.tag() != Some(key));
                before - items.len()
            }
            None => 0,
        }
    }

    /// Depth-first visit of this node and all descendants.
    pub fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut SExp)) {
        visit(self);
        if let SExp::List(list) = self {
            for item in &mut list.items {
                item.walk_mut(visit);
            }
        }
    }

    /// Forget recorded whitespace for the whole subtree.
    pub fn reset_layout(&mut self) {
        self.walk_mut(&mut |node| match node {
            SExp::Atom(atom) => atom.leading = None,
            SExp::List(list) => {
                list.leading = None;
                list.closing = None;
            }
        });
    }

    fn leading(&self) -> Option<&str> {
        match self {
            SExp::Atom(atom) => atom.leading.as_deref(),
            SExp::List(list) => list.leading.as_deref(),
        }
    }

    /// Serialize this node as a child at `depth` (1 = direct child of root).
    pub fn write_to(&self, out: &mut String, depth: usize, first: bool, prev_tag: Option<&str>) {
        match self.leading() {
            Some(leading) => out.push_str(leading),
            None => {
                if !first {
                    out.push_str(&self.synthetic_leading(depth, prev_tag));
                }
            }
        }
        match self {
            SExp::Atom(atom) => match &atom.raw {
                Some(raw) => out.push_str(raw),
                None => out.push_str(&render_atom(&atom.value, atom.quoted)),
            },
            SExp::List(list) => {
                out.push('(');
                let mut prev: Option<&str> = None;
                for (i, item) in list.items.iter().enumerate() {
                    item.write_to(out, depth + 1, i == 0, prev);
                    prev = item.tag();
                }
                match &list.closing {
                    Some(closing) => out.push_str(closing),
                    None => {
                        if list.items.iter().any(|item| matches!(item, SExp::List(_))) {
                            out.push('\n');
                            push_tabs(out, depth);
                        }
                    }
                }
                out.push(')');
            }
        }
    }

    fn synthetic_leading(&self, depth: usize, prev_tag: Option<&str>) -> String {
        match self {
            SExp::Atom(_) => " ".to_string(),
            SExp::List(_) => {
                if self.tag() == Some("xy") && prev_tag == Some("xy") {
                    " ".to_string()
                } else {
                    let mut s = String::from("\n");
                    push_tabs(&mut s, depth);
                    s
                }
            }
        }
    }
}

fn push_tabs(out: &mut String, count: usize) {
    for _ in 0..count {
        out.push('\t');
    }
}

impl fmt::Display for SExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_to(&mut out, 0, true, None);
        f.write_str(&out)
    }
}

/// Format a coordinate the way KiCad does: at most four decimals, no
/// trailing zeros, no negative zero.
pub fn format_number(value: f64) -> String {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    if rounded == 0.0 {
        return "0".to_string();
    }
    let mut s = format!("{:.4}", rounded);
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

fn render_atom(value: &str, quoted: bool) -> String {
    let needs_quotes = quoted
        || value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '(' || c == ')' || c == '"');
    if !needs_quotes {
        return value.to_string();
    }
    let mut s = String::with_capacity(value.len() + 2);
    s.push('"');
    for ch in value.chars() {
        match ch {
            '"' => s.push_str("\\\""),
            '\\' => s.push_str("\\\\"),
            '\n' => s.push_str("\\n"),
            _ => s.push(ch),
        }
    }
    s.push('"');
    s
}

/// A parsed file: the root node plus whatever follows it.
#[derive(Debug, Clone)]
pub struct SExpDocument {
    pub root: SExp,
    pub trailing: String,
}

impl SExpDocument {
    pub fn new(root: SExp) -> Self {
        Self {
            root,
            trailing: "\n".to_string(),
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.root.write_to(&mut out, 0, true, None);
        out.push_str(&self.trailing);
        out
    }
}

/// Reader over UTF-8 text; `pos` is a byte offset and always sits on a
/// character boundary.
pub struct SExpParser {
    input: String,
    pos: usize,
}

impl SExpParser {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
            pos: 0,
        }
    }

    pub fn parse(&mut self) -> Result<SExp, ParseError> {
        let leading = self.skip_whitespace();
        if self.is_eof() {
            return Err(ParseError::UnexpectedEof);
        }
        self.parse_sexp(leading)
    }

    /// Parse a whole file, keeping the text after the root list.
    pub fn parse_document(&mut self) -> Result<SExpDocument, ParseError> {
        let root = self.parse()?;
        let trailing = self.input[self.pos..].to_string();
        if trailing.chars().any(|c| !c.is_whitespace()) {
            return Err(ParseError::ParseError(
                self.pos,
                "unexpected content after root expression".to_string(),
            ));
        }
        Ok(SExpDocument { root, trailing })
    }

    fn parse_sexp(&mut self, leading: String) -> Result<SExp, ParseError> {
        if self.is_eof() {
            return Err(ParseError::UnexpectedEof);
        }

        if self.peek() == '(' {
            self.parse_list(leading)
        } else if self.peek() == ')' {
            Err(ParseError::ParseError(self.pos, "unbalanced ')'".to_string()))
        } else {
            self.parse_atom(leading)
        }
    }

    fn parse_list(&mut self, leading: String) -> Result<SExp, ParseError> {
        self.expect_char('(')?;
        let mut items = Vec::new();

        loop {
            let ws = self.skip_whitespace();

            if self.is_eof() {
                return Err(ParseError::UnexpectedEof);
            }

            if self.peek() == ')' {
                self.advance();
                return Ok(SExp::List(List {
                    items,
                    leading: Some(leading),
                    closing: Some(ws),
                }));
            }

            items.push(self.parse_sexp(ws)?);
        }
    }

    fn parse_atom(&mut self, leading: String) -> Result<SExp, ParseError> {
        if self.peek() == '"' {
            self.parse_string(leading)
        } else {
            self.parse_symbol(leading)
        }
    }

    fn parse_string(&mut self, leading: String) -> Result<SExp, ParseError> {
        let start = self.pos;
        self.expect_char('"')?;
        let mut s = String::new();
        let mut escaped = false;
        let mut closed = false;

        while !self.is_eof() {
            let ch = self.peek();
            self.advance();

            if escaped {
                match ch {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    _ => s.push(ch),
                }
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                closed = true;
                break;
            } else {
                s.push(ch);
            }
        }

        if !closed {
            return Err(ParseError::ParseError(start, "unterminated string".to_string()));
        }

        Ok(SExp::Atom(Atom {
            value: s,
            quoted: true,
            raw: Some(self.input[start..self.pos].to_string()),
            leading: Some(leading),
        }))
    }

    fn parse_symbol(&mut self, leading: String) -> Result<SExp, ParseError> {
        let mut s = String::new();

        while !self.is_eof() {
            let ch = self.peek();
            if ch.is_whitespace() || ch == '(' || ch == ')' || ch == '"' {
                break;
            }
            s.push(ch);
            self.advance();
        }

        if s.is_empty() {
            Err(ParseError::UnexpectedToken("empty symbol".to_string()))
        } else {
            Ok(SExp::Atom(Atom {
                raw: Some(s.clone()),
                value: s,
                quoted: false,
                leading: Some(leading),
            }))
        }
    }

    fn skip_whitespace(&mut self) -> String {
        let mut ws = String::new();
        while !self.is_eof() && self.peek().is_whitespace() {
            ws.push(self.peek());
            self.advance();
        }
        ws
    }

    fn peek(&self) -> char {
        self.input[self.pos..].chars().next().unwrap_or('\0')
    }

    fn advance(&mut self) {
        if let Some(ch) = self.input[self.pos..].chars().next() {
            self.pos += ch.len_utf8();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        if self.is_eof() {
            return Err(ParseError::UnexpectedEof);
        }

        let ch = self.peek();
        if ch == expected {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::UnexpectedToken(format!(
                "Expected '{}', found '{}'",
                expected, ch
            )))
        }
    }
}
