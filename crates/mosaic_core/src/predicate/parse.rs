//! Textual filter syntax parser.
//!
//! Grammar:
//! ```text
//! filter := '(' body ')'
//! body   := '&' filter+ | '|' filter+ | '!' filter | key '=' value
//! value  := '*'                 presence
//!         | text with '*'       wildcard
//!         | text                equality
//! ```
//! `\` escapes `(`, `)`, `*` and `\` inside keys and values; keys also
//! escape `=`.

use super::{Predicate, WildcardPattern};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Filter parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateError {
    Empty,
    UnexpectedEnd,
    Expected { expected: char, position: usize },
    EmptyKey { position: usize },
    EmptyComposite { position: usize },
    TrailingInput { position: usize },
    DanglingEscape,
    InvalidPattern(String),
}

impl Display for PredicateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "filter must not be empty"),
            Self::UnexpectedEnd => write!(f, "filter ended unexpectedly"),
            Self::Expected { expected, position } => {
                write!(f, "expected `{expected}` at position {position}")
            }
            Self::EmptyKey { position } => {
                write!(f, "filter key must not be empty at position {position}")
            }
            Self::EmptyComposite { position } => write!(
                f,
                "composite filter needs at least one operand at position {position}"
            ),
            Self::TrailingInput { position } => {
                write!(f, "unexpected input after filter at position {position}")
            }
            Self::DanglingEscape => write!(f, "escape character at end of filter value"),
            Self::InvalidPattern(message) => write!(f, "invalid wildcard pattern: {message}"),
        }
    }
}

impl Error for PredicateError {}

pub(super) fn parse_filter(text: &str) -> Result<Predicate, PredicateError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(PredicateError::Empty);
    }

    let mut parser = Parser {
        chars: trimmed.chars().collect(),
        position: 0,
    };
    let predicate = parser.filter()?;
    if parser.position != parser.chars.len() {
        return Err(PredicateError::TrailingInput {
            position: parser.position,
        });
    }
    Ok(predicate)
}

struct Parser {
    chars: Vec<char>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn expect(&mut self, expected: char) -> Result<(), PredicateError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.position += 1;
                Ok(())
            }
            Some(_) => Err(PredicateError::Expected {
                expected,
                position: self.position,
            }),
            None => Err(PredicateError::UnexpectedEnd),
        }
    }

    fn filter(&mut self) -> Result<Predicate, PredicateError> {
        self.expect('(')?;
        let predicate = match self.peek() {
            Some('&') => {
                self.position += 1;
                Predicate::And(self.operands()?)
            }
            Some('|') => {
                self.position += 1;
                Predicate::Or(self.operands()?)
            }
            Some('!') => {
                self.position += 1;
                Predicate::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(PredicateError::UnexpectedEnd),
        };
        self.expect(')')?;
        Ok(predicate)
    }

    fn operands(&mut self) -> Result<Vec<Predicate>, PredicateError> {
        let start = self.position;
        let mut operands = Vec::new();
        while self.peek() == Some('(') {
            operands.push(self.filter()?);
        }
        if operands.is_empty() {
            return Err(PredicateError::EmptyComposite { position: start });
        }
        Ok(operands)
    }

    fn item(&mut self) -> Result<Predicate, PredicateError> {
        let key_start = self.position;
        let mut key = String::new();
        loop {
            match self.peek() {
                Some('=') => break,
                Some('\\') => {
                    self.position += 1;
                    key.push(self.take_escaped()?);
                }
                Some('(') | Some(')') => {
                    return Err(PredicateError::Expected {
                        expected: '=',
                        position: self.position,
                    })
                }
                Some(c) => {
                    key.push(c);
                    self.position += 1;
                }
                None => return Err(PredicateError::UnexpectedEnd),
            }
        }
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(PredicateError::EmptyKey {
                position: key_start,
            });
        }
        self.expect('=')?;

        // `raw` keeps escapes for wildcard sources; `plain` is the literal value.
        let mut raw = String::new();
        let mut plain = String::new();
        let mut has_wildcard = false;
        loop {
            match self.peek() {
                Some(')') => break,
                Some('(') => {
                    return Err(PredicateError::Expected {
                        expected: ')',
                        position: self.position,
                    })
                }
                Some('\\') => {
                    self.position += 1;
                    let escaped = self.take_escaped()?;
                    raw.push('\\');
                    raw.push(escaped);
                    plain.push(escaped);
                }
                Some('*') => {
                    self.position += 1;
                    has_wildcard = true;
                    raw.push('*');
                    plain.push('*');
                }
                Some(c) => {
                    self.position += 1;
                    raw.push(c);
                    plain.push(c);
                }
                None => return Err(PredicateError::UnexpectedEnd),
            }
        }

        if raw == "*" {
            return Ok(Predicate::Present { key });
        }
        if has_wildcard {
            return Ok(Predicate::Like {
                key,
                pattern: WildcardPattern::new(&raw)?,
            });
        }
        Ok(Predicate::Equals { key, value: plain })
    }

    fn take_escaped(&mut self) -> Result<char, PredicateError> {
        match self.peek() {
            Some(c) => {
                self.position += 1;
                Ok(c)
            }
            None => Err(PredicateError::DanglingEscape),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PredicateError;
    use crate::predicate::{properties, Predicate};

    #[test]
    fn parses_equality_presence_and_wildcards() {
        assert_eq!(
            Predicate::parse("(name=x)").expect("equality"),
            Predicate::equals("name", "x")
        );
        assert_eq!(
            Predicate::parse("(name=*)").expect("presence"),
            Predicate::present("name")
        );
        let like = Predicate::parse("(name=orders-*)").expect("wildcard");
        assert!(like.matches(&properties([("name", "orders-db")])));
    }

    #[test]
    fn parses_nested_composites() {
        let predicate =
            Predicate::parse("(&(kind=db)(|(name=a)(name=b))(!(disabled=true)))").expect("nested");
        assert!(predicate.matches(&properties([("kind", "db"), ("name", "b")])));
        assert!(!predicate.matches(&properties([
            ("kind", "db"),
            ("name", "b"),
            ("disabled", "true"),
        ])));
    }

    #[test]
    fn display_round_trips_escaped_values() {
        let original = Predicate::equals("path", "a(b)*c");
        let text = original.to_string();
        assert_eq!(text, r"(path=a\(b\)\*c)");
        assert_eq!(Predicate::parse(&text).expect("round trip"), original);
    }

    #[test]
    fn display_round_trips_keys_containing_equals() {
        let original = Predicate::equals("a=b", "x");
        let text = original.to_string();
        assert_eq!(text, r"(a\=b=x)");
        let parsed = Predicate::parse(&text).expect("round trip");
        assert_eq!(parsed, original);
        assert!(parsed.matches(&properties([("a=b", "x")])));
        assert!(!parsed.matches(&properties([("a", "b=x")])));
    }

    #[test]
    fn rejects_malformed_filters() {
        assert_eq!(Predicate::parse("  "), Err(PredicateError::Empty));
        assert_eq!(
            Predicate::parse("(name=x"),
            Err(PredicateError::UnexpectedEnd)
        );
        assert_eq!(
            Predicate::parse("(=x)"),
            Err(PredicateError::EmptyKey { position: 1 })
        );
        assert_eq!(
            Predicate::parse("(&)"),
            Err(PredicateError::EmptyComposite { position: 2 })
        );
        assert_eq!(
            Predicate::parse("(a=b)(c=d)"),
            Err(PredicateError::TrailingInput { position: 5 })
        );
        assert!(matches!(
            Predicate::parse("name=x"),
            Err(PredicateError::Expected { expected: '(', .. })
        ));
    }
}
