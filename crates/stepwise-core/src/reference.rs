use std::fmt;
use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};

/// One step along a field path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Reference to a prior subtask's output, written `source.field[index]`.
///
/// `source` names either a subtask id or a tool name. The path may nest
/// (`extract.records[0].title`) and index arrays at any depth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourcePattern {
    pub source: String,
    pub path: Vec<Segment>,
}

impl SourcePattern {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || StepwiseError::InvalidReference(input.to_string());
        let trimmed = input.trim();
        let mut chars = trimmed.chars().peekable();

        let source = read_ident(&mut chars);
        if source.is_empty() {
            return Err(invalid());
        }

        let path = parse_segments(&trimmed[source.len()..]).ok_or_else(invalid)?;
        if !matches!(path.first(), Some(Segment::Key(_))) {
            return Err(invalid());
        }

        Ok(Self { source, path })
    }

    /// The top-level output field this pattern reads.
    pub fn field(&self) -> &str {
        match self.path.first() {
            Some(Segment::Key(k)) => k,
            _ => "",
        }
    }

    /// The trailing array index, if the pattern ends with one.
    pub fn last_index(&self) -> Option<usize> {
        match self.path.last() {
            Some(Segment::Index(i)) => Some(*i),
            _ => None,
        }
    }

    /// Copy of this pattern with the trailing index replaced.
    pub fn with_last_index(&self, index: usize) -> Self {
        let mut next = self.clone();
        match next.path.last_mut() {
            Some(Segment::Index(i)) => *i = index,
            _ => next.path.push(Segment::Index(index)),
        }
        next
    }

    /// Walk the path (everything after `source`) through a JSON value.
    ///
    /// Missing keys and out-of-range indices yield `None`.
    pub fn lookup<'a>(&self, root: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        walk(root, &self.path)
    }

    /// Render as an inline template reference.
    pub fn to_template(&self) -> String {
        format!("{{{{{}}}}}", self)
    }
}

/// Follow `path` from `root`.
pub fn walk<'a>(root: &'a serde_json::Value, path: &[Segment]) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for segment in path {
        current = match segment {
            Segment::Key(k) => current.get(k.as_str())?,
            Segment::Index(i) => current.as_array()?.get(*i)?,
        };
    }
    Some(current)
}

/// Parse a bare field path such as `items[0].title`.
pub fn parse_path(input: &str) -> Result<Vec<Segment>> {
    let path = parse_segments(&format!(".{}", input.trim()))
        .ok_or_else(|| StepwiseError::InvalidReference(input.to_string()))?;
    Ok(path)
}

/// Parse `.key` and `[index]` segments until the input is consumed.
fn parse_segments(text: &str) -> Option<Vec<Segment>> {
    let mut chars = text.chars().peekable();
    let mut path = Vec::new();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let key = read_ident(&mut chars);
                if key.is_empty() {
                    return None;
                }
                path.push(Segment::Key(key));
            }
            '[' => {
                let mut digits = String::new();
                let mut closed = false;
                for d in chars.by_ref() {
                    if d == ']' {
                        closed = true;
                        break;
                    }
                    digits.push(d);
                }
                if !closed {
                    return None;
                }
                path.push(Segment::Index(digits.trim().parse::<usize>().ok()?));
            }
            _ => return None,
        }
    }
    Some(path)
}

fn read_ident(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut ident = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || c == '_' || c == '-' {
            ident.push(c);
            chars.next();
        } else {
            break;
        }
    }
    ident
}

impl fmt::Display for SourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)?;
        for segment in &self.path {
            match segment {
                Segment::Key(k) => write!(f, ".{}", k)?,
                Segment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for SourcePattern {
    type Error = StepwiseError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SourcePattern> for String {
    fn from(pattern: SourcePattern) -> Self {
        pattern.to_string()
    }
}

impl std::str::FromStr for SourcePattern {
    type Err = StepwiseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// An inline `{{...}}` reference found inside a parameter string.
#[derive(Debug, Clone)]
pub struct TemplateRef {
    /// Byte range of the whole `{{...}}` span.
    pub span: Range<usize>,
    /// The text between the braces, trimmed.
    pub raw: String,
}

impl TemplateRef {
    pub fn pattern(&self) -> Result<SourcePattern> {
        SourcePattern::parse(&self.raw)
    }
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("template regex is valid")
    })
}

/// All inline template references in a string, in order of appearance.
pub fn templates_in(text: &str) -> Vec<TemplateRef> {
    template_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1)?;
            Some(TemplateRef {
                span: whole.range(),
                raw: inner.as_str().to_string(),
            })
        })
        .collect()
}

pub fn contains_template(text: &str) -> bool {
    template_regex().is_match(text)
}

/// If the whole string is exactly one template, return it.
pub fn whole_template(text: &str) -> Option<TemplateRef> {
    let trimmed = text.trim();
    let refs = templates_in(trimmed);
    match refs.as_slice() {
        [only] if only.span.start == 0 && only.span.end == trimmed.len() => Some(only.clone()),
        _ => None,
    }
}

/// Every template reference anywhere inside a JSON value.
pub fn templates_in_value(value: &serde_json::Value) -> Vec<TemplateRef> {
    let mut out = Vec::new();
    collect_templates(value, &mut out);
    out
}

fn collect_templates(value: &serde_json::Value, out: &mut Vec<TemplateRef>) {
    match value {
        serde_json::Value::String(s) => out.extend(templates_in(s)),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_templates(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_templates(v, out)),
        _ => {}
    }
}
