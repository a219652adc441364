//! Scheme engine: template expressions that derive field values.
//!
//! ```text
//! <:umlauts><firstname>[0].<lastname><:lower>[COUNTER2]
//! └──┬────┘└────┬─────┘└┬┘  └───┬────┘└──┬──┘└───┬────┘
//!  global    field    slice   field   global  counter
//! ```
//!
//! - `<name>` inserts a field; `<name:lower:strip>` applies modifiers to it.
//! - `<:mod>` applies a modifier to the whole rendered value.
//! - `[n]`, `[a:b]`, `[:b]`, `[a:]` slice the preceding field by character.
//! - `[ALWAYSCOUNTER]` renders `1, 2, 3, …`; `[COUNTER2]` renders `"", 2, 3, …`.
//! - Any other bracket content is literal; `\` escapes the next character.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::RoleScoped;
use crate::error::ConfigurationError;
use crate::normalize::transliterate;
use crate::record::{fields, Record, Role};

/// Error raised while parsing or rendering a scheme expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemeError {
    #[error("unterminated '<' at position {position}")]
    UnterminatedField { position: usize },

    #[error("unterminated '[' at position {position}")]
    UnterminatedBracket { position: usize },

    #[error("empty field reference at position {position}")]
    EmptyField { position: usize },

    #[error("unknown modifier ':{modifier}'")]
    UnknownModifier { modifier: String },

    #[error("an expression may contain only one counter")]
    MultipleCounters,

    #[error("dangling escape at end of expression")]
    DanglingEscape,

    #[error("unknown field '{field}'")]
    UnknownField { field: String },
}

/// A text transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Lower,
    Upper,
    /// Transliterate through the normalizer.
    Umlauts,
    /// Trim surrounding whitespace.
    Strip,
}

impl Modifier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Modifier::Lower => "lower",
            Modifier::Upper => "upper",
            Modifier::Umlauts => "umlauts",
            Modifier::Strip => "strip",
        }
    }

    pub fn apply(&self, text: &str) -> String {
        match self {
            Modifier::Lower => text.to_lowercase(),
            Modifier::Upper => text.to_uppercase(),
            Modifier::Umlauts => transliterate(text),
            Modifier::Strip => text.trim().to_string(),
        }
    }
}

impl FromStr for Modifier {
    type Err = SchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lower" => Ok(Modifier::Lower),
            "upper" => Ok(Modifier::Upper),
            "umlauts" => Ok(Modifier::Umlauts),
            "strip" => Ok(Modifier::Strip),
            other => Err(SchemeError::UnknownModifier {
                modifier: other.to_string(),
            }),
        }
    }
}

/// Counter placeholder style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterStyle {
    /// `[ALWAYSCOUNTER]`: 1, 2, 3, …
    Always,
    /// `[COUNTER2]`: empty, 2, 3, …
    FromTwo,
}

impl CounterStyle {
    /// Render the counter for the given 0-based attempt.
    pub fn render(&self, attempt: u32) -> String {
        match (self, attempt) {
            (CounterStyle::FromTwo, 0) => String::new(),
            (_, n) => (n + 1).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slice {
    Index(usize),
    Range(Option<usize>, Option<usize>),
}

impl Slice {
    fn parse(content: &str) -> Option<Slice> {
        let is_num = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        match content.split_once(':') {
            None if is_num(content) => content.parse().ok().map(Slice::Index),
            Some((a, b)) if (a.is_empty() || is_num(a)) && (b.is_empty() || is_num(b)) => {
                let start = if a.is_empty() { None } else { a.parse().ok() };
                let end = if b.is_empty() { None } else { b.parse().ok() };
                Some(Slice::Range(start, end))
            }
            _ => None,
        }
    }

    fn apply(&self, text: &str) -> String {
        let len = text.chars().count();
        let (start, end) = match *self {
            Slice::Index(i) => (i, i.saturating_add(1)),
            Slice::Range(a, b) => (a.unwrap_or(0), b.unwrap_or(len)),
        };
        let end = end.min(len);
        if start >= end {
            return String::new();
        }
        text.chars().skip(start).take(end - start).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Field {
        name: String,
        modifiers: Vec<Modifier>,
        slice: Option<Slice>,
    },
    Counter(CounterStyle),
}

/// Source of field values for rendering.
pub trait FieldSource {
    /// Value of `name`. `None` means the field is unknown; a known field
    /// without a value yields `Some("")`.
    fn lookup(&self, name: &str) -> Option<&str>;
}

impl FieldSource for BTreeMap<String, String> {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl FieldSource for Record {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name).or_else(|| {
            let known = [
                fields::SOURCE_UID,
                fields::RECORD_UID,
                fields::SCHOOL,
                fields::ROLE,
            ]
            .contains(&name)
                || fields::KNOWN_SCALAR.contains(&name)
                || self.fields.contains_key(name)
                || self.extra_properties.contains_key(name);
            known.then_some("")
        })
    }
}

/// Result of rendering: text around an optional counter placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub prefix: String,
    pub counter: Option<CounterStyle>,
    pub suffix: String,
}

impl Rendered {
    /// The value with the counter at its first (possibly empty) rendering.
    pub fn first(&self) -> String {
        self.with_counter(0)
    }

    /// The value with the counter rendered for the given attempt.
    pub fn with_counter(&self, attempt: u32) -> String {
        let counter = self
            .counter
            .map(|c| c.render(attempt))
            .unwrap_or_default();
        format!("{}{}{}", self.prefix, counter, self.suffix)
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty() && self.suffix.is_empty()
    }
}

/// A parsed scheme expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeExpression {
    source: String,
    tokens: Vec<Token>,
    global: Vec<Modifier>,
}

impl SchemeExpression {
    pub fn parse(source: &str) -> Result<Self, SchemeError> {
        let chars: Vec<char> = source.chars().collect();
        let mut tokens: Vec<Token> = Vec::new();
        let mut global: Vec<Modifier> = Vec::new();
        let mut literal = String::new();
        let mut has_counter = false;
        let mut i = 0;

        let flush = |literal: &mut String, tokens: &mut Vec<Token>| {
            if !literal.is_empty() {
                tokens.push(Token::Literal(std::mem::take(literal)));
            }
        };

        while i < chars.len() {
            match chars[i] {
                '\\' => {
                    let escaped = chars.get(i + 1).ok_or(SchemeError::DanglingEscape)?;
                    literal.push(*escaped);
                    i += 2;
                }
                '<' => {
                    let close = find_close(&chars, i, '>')
                        .ok_or(SchemeError::UnterminatedField { position: i })?;
                    let content: String = chars[i + 1..close].iter().collect();
                    flush(&mut literal, &mut tokens);
                    if let Some(mods) = content.strip_prefix(':') {
                        for m in mods.split(':').filter(|m| !m.is_empty()) {
                            global.push(m.parse::<Modifier>()?);
                        }
                    } else {
                        let mut parts = content.split(':');
                        let name = parts.next().unwrap_or_default().trim().to_string();
                        if name.is_empty() {
                            return Err(SchemeError::EmptyField { position: i });
                        }
                        let modifiers = parts
                            .filter(|m| !m.is_empty())
                            .map(str::parse::<Modifier>)
                            .collect::<Result<Vec<_>, SchemeError>>()?;
                        tokens.push(Token::Field {
                            name,
                            modifiers,
                            slice: None,
                        });
                    }
                    i = close + 1;
                }
                '[' => {
                    let close = find_close(&chars, i, ']')
                        .ok_or(SchemeError::UnterminatedBracket { position: i })?;
                    let content: String = chars[i + 1..close].iter().collect();
                    let counter = match content.as_str() {
                        "ALWAYSCOUNTER" => Some(CounterStyle::Always),
                        "COUNTER2" => Some(CounterStyle::FromTwo),
                        _ => None,
                    };
                    if let Some(style) = counter {
                        if has_counter {
                            return Err(SchemeError::MultipleCounters);
                        }
                        has_counter = true;
                        flush(&mut literal, &mut tokens);
                        tokens.push(Token::Counter(style));
                    } else if let (true, Some(Token::Field { slice, .. }), Some(parsed)) =
                        (literal.is_empty(), tokens.last_mut(), Slice::parse(&content))
                    {
                        if slice.is_none() {
                            *slice = Some(parsed);
                        } else {
                            literal.push_str(&format!("[{content}]"));
                        }
                    } else {
                        literal.push_str(&format!("[{content}]"));
                    }
                    i = close + 1;
                }
                c => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        flush(&mut literal, &mut tokens);

        Ok(Self {
            source: source.to_string(),
            tokens,
            global,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_counter(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, Token::Counter(_)))
    }

    /// Names of all fields the expression reads.
    pub fn references(&self) -> BTreeSet<&str> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                Token::Field { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Render against `source`, applying `extra` modifiers after the
    /// expression's own global modifiers.
    pub fn render(
        &self,
        source: &dyn FieldSource,
        extra: &[Modifier],
    ) -> Result<Rendered, SchemeError> {
        let mut prefix = String::new();
        let mut suffix = String::new();
        let mut counter = None;

        for token in &self.tokens {
            let out = if counter.is_some() {
                &mut suffix
            } else {
                &mut prefix
            };
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Field {
                    name,
                    modifiers,
                    slice,
                } => {
                    let raw = source
                        .lookup(name)
                        .ok_or_else(|| SchemeError::UnknownField { field: name.clone() })?;
                    let mut value = raw.to_string();
                    for m in modifiers {
                        value = m.apply(&value);
                    }
                    if let Some(slice) = slice {
                        value = slice.apply(&value);
                    }
                    out.push_str(&value);
                }
                Token::Counter(style) => counter = Some(*style),
            }
        }

        let mut mods: Vec<Modifier> = self.global.iter().chain(extra).copied().collect();
        // umlauts before strip before case changes
        mods.sort_by_key(|m| match m {
            Modifier::Umlauts => 0,
            Modifier::Strip => 1,
            Modifier::Lower | Modifier::Upper => 2,
        });
        mods.dedup();
        for m in mods {
            match m {
                Modifier::Strip => {
                    prefix = prefix.trim_start().to_string();
                    suffix = suffix.trim_end().to_string();
                    if suffix.is_empty() {
                        prefix = prefix.trim_end().to_string();
                    }
                }
                other => {
                    prefix = other.apply(&prefix);
                    suffix = other.apply(&suffix);
                }
            }
        }

        Ok(Rendered {
            prefix,
            counter,
            suffix,
        })
    }
}

impl fmt::Display for SchemeExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn find_close(chars: &[char], open: usize, close: char) -> Option<usize> {
    chars[open + 1..]
        .iter()
        .position(|c| *c == close)
        .map(|p| open + 1 + p)
}

/// Evaluate `expression` against `record`; counters render at their first value.
pub fn evaluate(
    expression: &str,
    record: &Record,
    modifiers: &[Modifier],
) -> Result<String, SchemeError> {
    Ok(SchemeExpression::parse(expression)?
        .render(record, modifiers)?
        .first())
}

/// All configured schemes, compiled and in dependency order.
#[derive(Debug, Clone, Default)]
pub struct SchemeSet {
    ordered: Vec<(String, RoleScoped<SchemeExpression>)>,
}

impl SchemeSet {
    /// Compile the `scheme` configuration section.
    ///
    /// `known` lists every field a scheme may read besides other schemes.
    pub fn compile(
        schemes: &BTreeMap<String, RoleScoped<String>>,
        known: &BTreeSet<String>,
    ) -> Result<Self, ConfigurationError> {
        let mut compiled: BTreeMap<String, RoleScoped<SchemeExpression>> = BTreeMap::new();
        for (field, setting) in schemes {
            let expr = setting
                .try_map(|s| SchemeExpression::parse(s))
                .map_err(|source| ConfigurationError::Scheme {
                    field: field.clone(),
                    source,
                })?;
            for variant in expr.values() {
                for reference in variant.references() {
                    if !known.contains(reference) && !schemes.contains_key(reference) {
                        return Err(ConfigurationError::UnknownReference {
                            field: field.clone(),
                            reference: reference.to_string(),
                        });
                    }
                }
            }
            compiled.insert(field.clone(), expr);
        }

        let order = dependency_order(&compiled)?;
        let ordered = order
            .into_iter()
            .filter_map(|f| compiled.remove(&f).map(|e| (f, e)))
            .collect();
        Ok(Self { ordered })
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.ordered.iter().any(|(f, _)| f == field)
    }

    /// Schemes applicable to `role`, in evaluation order.
    pub fn for_role(&self, role: Role) -> impl Iterator<Item = (&str, &SchemeExpression)> {
        self.ordered
            .iter()
            .filter_map(move |(f, e)| e.for_role(role).map(|e| (f.as_str(), e)))
    }

    /// Fields whose scheme depends, directly or transitively, on `changed`.
    pub fn dependents_of(&self, changed: &str) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = BTreeSet::new();
        for (field, expr) in &self.ordered {
            let depends = expr.values().any(|e| {
                e.references()
                    .iter()
                    .any(|r| *r != field.as_str() && (*r == changed || out.contains(*r)))
            });
            if depends {
                out.insert(field.clone());
            }
        }
        out
    }
}

fn dependency_order(
    compiled: &BTreeMap<String, RoleScoped<SchemeExpression>>,
) -> Result<Vec<String>, ConfigurationError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        field: &str,
        compiled: &BTreeMap<String, RoleScoped<SchemeExpression>>,
        marks: &mut BTreeMap<String, Mark>,
        stack: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), ConfigurationError> {
        match marks.get(field) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|f| f == field).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].to_vec();
                cycle.push(field.to_string());
                return Err(ConfigurationError::SchemeCycle { cycle });
            }
            None => {}
        }
        marks.insert(field.to_string(), Mark::Visiting);
        stack.push(field.to_string());
        if let Some(expr) = compiled.get(field) {
            let deps: BTreeSet<&str> = expr.values().flat_map(|e| e.references()).collect();
            for dep in deps {
                if dep != field && compiled.contains_key(dep) {
                    visit(dep, compiled, marks, stack, order)?;
                }
            }
        }
        stack.pop();
        marks.insert(field.to_string(), Mark::Done);
        order.push(field.to_string());
        Ok(())
    }

    let mut marks = BTreeMap::new();
    let mut order = Vec::new();
    for field in compiled.keys() {
        visit(field, compiled, &mut marks, &mut Vec::new(), &mut order)?;
    }
    Ok(order)
}
