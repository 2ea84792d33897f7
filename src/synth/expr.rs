//! Typed Nix expression builder
//!
//! Configuration files are assembled as values and serialized here, so probed
//! text (host names, key comments, interface names) can never break out of the
//! string it was placed in.

use crate::error::{Result, TakeoverError};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Lists and attribute sets shorter than this stay on one line
const INLINE_WIDTH: usize = 64;

const KEYWORDS: &[&str] = &[
    "assert", "else", "if", "in", "inherit", "let", "or", "rec", "then", "with",
];

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_'-]*$").expect("valid regex"))
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(<[A-Za-z0-9._+/-]+>|(\.{1,2}|~)?(/[A-Za-z0-9._+-]+)+)$").expect("valid regex")
    })
}

/// A Nix value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `true` / `false`
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Double-quoted string
    Str(String),
    /// Indented (`''`) string, one entry per line
    Indented(Vec<String>),
    /// Path literal such as `./hardware-configuration.nix` or `<nixpkgs>`
    Path(String),
    /// Variable reference, possibly dotted (`lib.mkForce`)
    Ident(String),
    /// List
    List(Vec<Value>),
    /// Attribute set
    Attrs(AttrSet),
    /// Function application `f x`
    Apply(Box<Value>, Box<Value>),
    /// Addition / concatenation `a + b`
    Add(Box<Value>, Box<Value>),
}

impl Value {
    /// Path literal
    pub fn path<S: Into<String>>(path: S) -> Self {
        Self::Path(path.into())
    }

    /// Variable reference
    pub fn ident<S: Into<String>>(name: S) -> Self {
        Self::Ident(name.into())
    }

    /// `f x`
    pub fn apply(function: Value, argument: Value) -> Self {
        Self::Apply(Box::new(function), Box::new(argument))
    }

    /// `a + b`
    pub fn add(lhs: Value, rhs: Value) -> Self {
        Self::Add(Box::new(lhs), Box::new(rhs))
    }

    /// `lib.mkForce x`
    pub fn mk_force(value: Value) -> Self {
        Self::apply(Self::ident("lib.mkForce"), value)
    }

    /// List of strings
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(items.into_iter().map(|s| Value::Str(s.into())).collect())
    }

    fn is_compound(&self) -> bool {
        matches!(self, Self::Apply(..) | Self::Add(..))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<AttrSet> for Value {
    fn from(v: AttrSet) -> Self {
        Self::Attrs(v)
    }
}

/// Attribute path such as `fileSystems."/"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttrPath(Vec<String>);

impl AttrPath {
    fn render(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(TakeoverError::render("empty attribute path"));
        }
        Ok(self
            .0
            .iter()
            .map(|segment| {
                if identifier_re().is_match(segment) && !KEYWORDS.contains(&segment.as_str()) {
                    segment.clone()
                } else {
                    quote(segment)
                }
            })
            .collect::<Vec<_>>()
            .join("."))
    }
}

/// Dotted form, each `.` separates a segment
impl From<&str> for AttrPath {
    fn from(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_string).collect())
    }
}

/// Explicit segments, for keys that contain dots or slashes
impl<const N: usize> From<[&str; N]> for AttrPath {
    fn from(segments: [&str; N]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }
}

/// Ordered attribute set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrSet {
    entries: Vec<(AttrPath, Value)>,
}

impl AttrSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute, builder style
    pub fn with<P: Into<AttrPath>, V: Into<Value>>(mut self, path: P, value: V) -> Self {
        self.set(path, value);
        self
    }

    /// Add an attribute
    pub fn set<P: Into<AttrPath>, V: Into<Value>>(&mut self, path: P, value: V) -> &mut Self {
        self.entries.push((path.into(), value.into()));
        self
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no attributes
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (path, _) in &self.entries {
            if !seen.insert(path) {
                return Err(TakeoverError::render(format!(
                    "attribute {} defined twice",
                    path.render()?
                )));
            }
        }
        Ok(())
    }
}

/// A complete `.nix` file: a module function returning an attribute set
#[derive(Debug, Clone, PartialEq)]
pub struct NixFile {
    comments: Vec<String>,
    args: Vec<String>,
    body: AttrSet,
}

impl NixFile {
    /// Module taking the given named arguments (`...` is always appended)
    pub fn module(args: &[&str], body: AttrSet) -> Self {
        Self {
            comments: Vec::new(),
            args: args.iter().map(|a| a.to_string()).collect(),
            body,
        }
    }

    /// Add a leading `#` comment line
    pub fn comment<S: Into<String>>(mut self, line: S) -> Self {
        self.comments.push(line.into());
        self
    }

    /// Serialize the file
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        for comment in &self.comments {
            for line in comment.lines() {
                out.push_str(format!("# {}", line).trim_end());
                out.push('\n');
            }
        }

        let mut params = Vec::new();
        for arg in &self.args {
            if !identifier_re().is_match(arg) {
                return Err(TakeoverError::render(format!("invalid argument name '{}'", arg)));
            }
            params.push(arg.as_str());
        }
        params.push("...");
        out.push_str(&format!("{{ {} }}:\n", params.join(", ")));

        render_attrs_block(&self.body, 0, &mut out)?;
        out.push('\n');
        Ok(out)
    }
}

/// Double-quoted Nix string with escaping
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn escape_indented(line: &str) -> String {
    line.replace("''", "'''").replace("${", "''${")
}

fn scalar(value: &Value) -> Result<Option<String>> {
    let text = match value {
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Str(s) => quote(s),
        Value::Path(p) => {
            if !path_re().is_match(p) {
                return Err(TakeoverError::render(format!("invalid path literal '{}'", p)));
            }
            p.clone()
        }
        Value::Ident(name) => {
            if !name.split('.').all(|part| identifier_re().is_match(part)) {
                return Err(TakeoverError::render(format!("invalid identifier '{}'", name)));
            }
            name.clone()
        }
        Value::Apply(function, argument) => {
            format!("{} {}", operand(function)?, operand(argument)?)
        }
        Value::Add(lhs, rhs) => format!("{} + {}", operand(lhs)?, operand(rhs)?),
        _ => return Ok(None),
    };
    Ok(Some(text))
}

fn operand(value: &Value) -> Result<String> {
    let text = scalar(value)?.ok_or_else(|| {
        TakeoverError::render("only simple values can be applied or added".to_string())
    })?;
    Ok(if value.is_compound() {
        format!("({})", text)
    } else {
        text
    })
}

fn list_item(value: &Value) -> Result<Option<String>> {
    Ok(scalar(value)?.map(|text| {
        if value.is_compound() {
            format!("({})", text)
        } else {
            text
        }
    }))
}

fn inline(value: &Value) -> Result<Option<String>> {
    if let Some(text) = scalar(value)? {
        return Ok(Some(text));
    }

    let text = match value {
        Value::List(items) if items.is_empty() => return Ok(Some("[ ]".to_string())),
        Value::List(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match list_item(item)? {
                    Some(text) => parts.push(text),
                    None => return Ok(None),
                }
            }
            format!("[ {} ]", parts.join(" "))
        }
        Value::Attrs(attrs) if attrs.is_empty() => return Ok(Some("{ }".to_string())),
        Value::Attrs(attrs) => {
            attrs.check_unique()?;
            let mut parts = Vec::with_capacity(attrs.len());
            for (path, value) in &attrs.entries {
                match scalar(value)? {
                    Some(text) => parts.push(format!("{} = {};", path.render()?, text)),
                    None => return Ok(None),
                }
            }
            format!("{{ {} }}", parts.join(" "))
        }
        _ => return Ok(None),
    };

    Ok(if text.len() <= INLINE_WIDTH {
        Some(text)
    } else {
        None
    })
}

fn pad(indent: usize) -> String {
    " ".repeat(indent)
}

fn render_attrs_block(attrs: &AttrSet, indent: usize, out: &mut String) -> Result<()> {
    attrs.check_unique()?;
    out.push_str("{\n");
    for (path, value) in &attrs.entries {
        out.push_str(&pad(indent + 2));
        out.push_str(&path.render()?);
        out.push_str(" = ");
        render_value(value, indent + 2, out)?;
        out.push_str(";\n");
    }
    out.push_str(&pad(indent));
    out.push('}');
    Ok(())
}

fn render_value(value: &Value, indent: usize, out: &mut String) -> Result<()> {
    if let Some(text) = inline(value)? {
        out.push_str(&text);
        return Ok(());
    }

    match value {
        Value::Attrs(attrs) => render_attrs_block(attrs, indent, out)?,
        Value::List(items) => {
            out.push_str("[\n");
            for item in items {
                out.push_str(&pad(indent + 2));
                match list_item(item)? {
                    Some(text) => out.push_str(&text),
                    None => render_value(item, indent + 2, out)?,
                }
                out.push('\n');
            }
            out.push_str(&pad(indent));
            out.push(']');
        }
        Value::Indented(lines) => {
            out.push_str("''\n");
            for line in lines {
                let line = line.replace('\r', "");
                if !line.is_empty() {
                    out.push_str(&pad(indent + 2));
                    out.push_str(&escape_indented(&line));
                }
                out.push('\n');
            }
            out.push_str(&pad(indent));
            out.push_str("''");
        }
        other => {
            return Err(TakeoverError::render(format!(
                "cannot render value {:?}",
                other
            )))
        }
    }
    Ok(())
}
