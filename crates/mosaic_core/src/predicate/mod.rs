//! Boolean matchers over flat property maps.
//!
//! # Responsibility
//! - Decide whether a registration's [`Properties`] satisfy a filter.
//! - Parse and render the textual filter syntax `(&(key=value)(other=*))`.
//!
//! # Invariants
//! - Matching is pure: it never mutates the map and has no side effects.
//! - `Display` output parses back into an equivalent predicate.

mod parse;
mod value;

pub use parse::PredicateError;
pub use value::{properties, Properties, PropertyValue};

use regex::Regex;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Filter over a registration property map.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Property exists and its text rendering equals `value`.
    Equals { key: String, value: String },
    /// Property exists with any value.
    Present { key: String },
    /// Property text rendering matches a `*` wildcard pattern.
    Like { key: String, pattern: WildcardPattern },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn present(key: impl Into<String>) -> Self {
        Self::Present { key: key.into() }
    }

    /// Creates a wildcard matcher; `*` matches any run of characters.
    pub fn like(key: impl Into<String>, pattern: &str) -> Result<Self, PredicateError> {
        Ok(Self::Like {
            key: key.into(),
            pattern: WildcardPattern::new(pattern)?,
        })
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut items) => {
                items.push(other);
                Self::And(items)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut items) => {
                items.push(other);
                Self::Or(items)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Builds the conjunction of equalities for every map entry.
    ///
    /// Returns `None` for an empty map, meaning "match everything".
    pub fn from_properties(properties: &Properties) -> Option<Self> {
        let mut terms = Vec::with_capacity(properties.len());
        for (key, value) in properties {
            match value {
                PropertyValue::List(items) => {
                    for item in items {
                        terms.push(Self::equals(key.as_str(), item.to_string()));
                    }
                }
                scalar => terms.push(Self::equals(key.as_str(), scalar.to_string())),
            }
        }
        match terms.len() {
            0 => None,
            1 => terms.pop(),
            _ => Some(Self::And(terms)),
        }
    }

    /// Parses the textual filter syntax.
    pub fn parse(text: &str) -> Result<Self, PredicateError> {
        parse::parse_filter(text)
    }

    /// Evaluates the predicate against one property map.
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Self::Equals { key, value } => properties
                .get(key)
                .is_some_and(|actual| actual.matches_text(value)),
            Self::Present { key } => properties.contains_key(key),
            Self::Like { key, pattern } => properties
                .get(key)
                .is_some_and(|actual| actual.any_rendering(&|text| pattern.is_match(text))),
            Self::And(items) => items.iter().all(|item| item.matches(properties)),
            Self::Or(items) => items.iter().any(|item| item.matches(properties)),
            Self::Not(inner) => !inner.matches(properties),
        }
    }
}

/// Matches an optional predicate; `None` matches every map.
pub fn matches_optional(predicate: Option<&Predicate>, properties: &Properties) -> bool {
    predicate.map_or(true, |predicate| predicate.matches(properties))
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Equals { key, value },
                Self::Equals {
                    key: other_key,
                    value: other_value,
                },
            ) => key == other_key && value == other_value,
            (Self::Present { key }, Self::Present { key: other_key }) => key == other_key,
            (
                Self::Like { key, pattern },
                Self::Like {
                    key: other_key,
                    pattern: other_pattern,
                },
            ) => key == other_key && pattern.source() == other_pattern.source(),
            (Self::And(items), Self::And(other_items)) => items == other_items,
            (Self::Or(items), Self::Or(other_items)) => items == other_items,
            (Self::Not(inner), Self::Not(other_inner)) => inner == other_inner,
            _ => false,
        }
    }
}

impl Display for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equals { key, value } => {
                write!(f, "({}={})", escape_key(key), escape(value))
            }
            Self::Present { key } => write!(f, "({}=*)", escape_key(key)),
            Self::Like { key, pattern } => {
                write!(f, "({}={})", escape_key(key), pattern.source())
            }
            Self::And(items) => {
                write!(f, "(&")?;
                for item in items {
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Self::Or(items) => {
                write!(f, "(|")?;
                for item in items {
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Self::Not(inner) => write!(f, "(!{inner})"),
        }
    }
}

impl FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        Self::parse(text)
    }
}

/// Wildcard pattern compiled to an anchored regular expression.
///
/// `source` keeps the escaped filter-text form, so `\*` stays a literal star.
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    source: String,
    regex: Regex,
}

impl WildcardPattern {
    /// Compiles a pattern where `*` is a wildcard and `\` escapes the next char.
    pub fn new(source: &str) -> Result<Self, PredicateError> {
        let mut expression = String::with_capacity(source.len() + 8);
        expression.push('^');
        let mut chars = source.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => expression.push_str(".*"),
                '\\' => match chars.next() {
                    Some(escaped) => expression.push_str(&regex::escape(&escaped.to_string())),
                    None => return Err(PredicateError::DanglingEscape),
                },
                other => expression.push_str(&regex::escape(&other.to_string())),
            }
        }
        expression.push('$');

        let regex = Regex::new(&expression)
            .map_err(|err| PredicateError::InvalidPattern(err.to_string()))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

fn escape(raw: &str) -> String {
    escape_with(raw, &['(', ')', '*', '\\'])
}

// Keys end at the first unescaped `=`.
fn escape_key(raw: &str) -> String {
    escape_with(raw, &['(', ')', '*', '\\', '='])
}

fn escape_with(raw: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
