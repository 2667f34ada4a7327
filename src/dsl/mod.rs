//! Regex-algebra combinators that lower to a regular expression string.
//!
//! Terms are plain values: build them with the constructors and combinator
//! methods, lower them with [`to_regex`], and test candidate strings with
//! [`Term::matches`]. The tree structure pretty-prints via `Display`.
//!
//! ```rust
//! use tokenrail::dsl::{either, to_regex};
//!
//! # fn main() -> Result<(), tokenrail::Error> {
//! let answer = either(["yes", "no", "maybe"])?.one_or_more();
//! assert_eq!(to_regex(&answer)?, "((yes|no|maybe))+");
//! assert!(answer.matches("yesyesmaybe")?);
//! assert!(!answer.matches("")?);
//! # Ok(())
//! # }
//! ```

use serde_json::Value;

use crate::json_schema;
use crate::{Error, Result};

mod printer;
pub mod types;

pub use types::{term_from_type, TypeExpr};

/// A node of the regex algebra.
///
/// Every variant lowers deterministically to a regex string; equality is
/// structural over the tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    /// Matches the characters verbatim.
    Literal(String),
    /// An embedded regular expression.
    Regex(String),
    /// Matches any JSON value conforming to the schema.
    JsonSchema {
        schema: Value,
        whitespace_pattern: Option<String>,
    },
    /// Zero or more repetitions.
    KleeneStar(Box<Term>),
    /// One or more repetitions.
    KleenePlus(Box<Term>),
    /// Zero or one occurrence.
    Optional(Box<Term>),
    /// Any one of the alternatives; never empty.
    Alternatives(Vec<Term>),
    /// The terms in order, no separators; never empty.
    Sequence(Vec<Term>),
    /// Exactly `n` repetitions.
    QuantifyExact(Box<Term>, usize),
    /// At least `m` repetitions.
    QuantifyMinimum(Box<Term>, usize),
    /// At most `n` repetitions.
    QuantifyMaximum(Box<Term>, usize),
    /// Between `m` and `n` repetitions, `m <= n`.
    QuantifyBetween(Box<Term>, usize, usize),
    /// A prebuilt automaton, carried by the pattern it was compiled from.
    Fsm(String),
}

/// A context-free grammar definition, held verbatim for the CFG extension
/// point. Unlike [`Term`], a grammar does not lower to a regex.
#[derive(Clone, Debug, PartialEq)]
pub struct Cfg {
    definition: String,
}

impl Cfg {
    pub fn definition(&self) -> &str {
        &self.definition
    }
}

/// Matches the characters of `s` verbatim.
pub fn literal(s: impl Into<String>) -> Term {
    Term::Literal(s.into())
}

/// Embeds a regular expression.
pub fn regex(pattern: impl Into<String>) -> Term {
    Term::Regex(pattern.into())
}

/// Matches any JSON value conforming to the schema.
///
/// The schema is parsed and compiled once up front, so an unsupported
/// schema fails here rather than at lowering time.
pub fn json_schema(schema: &str) -> Result<Term> {
    json_schema_with_whitespace(schema, None)
}

/// Like [`json_schema`], with an explicit whitespace pattern.
pub fn json_schema_with_whitespace(schema: &str, whitespace: Option<&str>) -> Result<Term> {
    let value: Value = serde_json::from_str(schema).map_err(crate::SchemaError::from)?;
    json_schema::regex_from_value(&value, whitespace, None)?;
    Ok(Term::JsonSchema {
        schema: value,
        whitespace_pattern: whitespace.map(str::to_string),
    })
}

/// Wraps the pattern of an already-compiled automaton.
pub fn fsm(pattern: impl Into<String>) -> Term {
    Term::Fsm(pattern.into())
}

/// Any one of the alternatives. Fails on an empty list.
pub fn either<I>(alternatives: I) -> Result<Term>
where
    I: IntoIterator,
    I::Item: Into<Term>,
{
    let terms: Vec<Term> = alternatives.into_iter().map(Into::into).collect();
    if terms.is_empty() {
        return Err(Error::EmptyAlternation);
    }
    Ok(Term::Alternatives(terms))
}

/// A context-free grammar for the scaffolded CFG extension.
pub fn cfg(definition: impl Into<String>) -> Cfg {
    Cfg {
        definition: definition.into(),
    }
}

/// Repetition helpers shared by every explicitly bounded builder.
pub fn zero_or_more(term: impl Into<Term>) -> Term {
    term.into().zero_or_more()
}

pub fn one_or_more(term: impl Into<Term>) -> Term {
    term.into().one_or_more()
}

pub fn optional(term: impl Into<Term>) -> Term {
    term.into().optional()
}

pub fn exactly(term: impl Into<Term>, count: usize) -> Term {
    term.into().exactly(count)
}

pub fn at_least(term: impl Into<Term>, count: usize) -> Term {
    term.into().at_least(count)
}

pub fn at_most(term: impl Into<Term>, count: usize) -> Term {
    term.into().at_most(count)
}

pub fn between(term: impl Into<Term>, min: usize, max: usize) -> Result<Term> {
    term.into().between(min, max)
}

impl Term {
    /// This term followed by `other`.
    pub fn concat(self, other: impl Into<Term>) -> Term {
        Term::Sequence(vec![self, other.into()])
    }

    /// Either this term or `other`.
    pub fn alternate(self, other: impl Into<Term>) -> Term {
        Term::Alternatives(vec![self, other.into()])
    }

    pub fn optional(self) -> Term {
        Term::Optional(Box::new(self))
    }

    pub fn zero_or_more(self) -> Term {
        Term::KleeneStar(Box::new(self))
    }

    pub fn one_or_more(self) -> Term {
        Term::KleenePlus(Box::new(self))
    }

    pub fn exactly(self, count: usize) -> Term {
        Term::QuantifyExact(Box::new(self), count)
    }

    pub fn at_least(self, count: usize) -> Term {
        Term::QuantifyMinimum(Box::new(self), count)
    }

    pub fn at_most(self, count: usize) -> Term {
        Term::QuantifyMaximum(Box::new(self), count)
    }

    /// Between `min` and `max` repetitions; fails when `min > max`.
    pub fn between(self, min: usize, max: usize) -> Result<Term> {
        if min > max {
            return Err(Error::InvalidQuantifier { min, max });
        }
        Ok(Term::QuantifyBetween(Box::new(self), min, max))
    }

    /// Lowers this term to its regular expression.
    pub fn to_regex(&self) -> Result<String> {
        to_regex(self)
    }

    /// Full-anchored test of `s` against the lowered regex.
    pub fn matches(&self, s: &str) -> Result<bool> {
        let pattern = self.to_regex()?;
        let re = regex::Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(re.is_match(s))
    }

    /// Fails with `PatternMismatch` unless `s` matches.
    pub fn validate(&self, s: &str) -> Result<()> {
        if self.matches(s)? {
            Ok(())
        } else {
            Err(Error::PatternMismatch {
                input: s.to_string(),
                pattern: self.to_regex()?,
            })
        }
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Term::Literal(s.to_string())
    }
}

impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::Literal(s)
    }
}

/// Lowers a term to its regular expression string.
///
/// Total over the variants: literals are escaped, embedded patterns and
/// alternations are grouped, quantifiers wrap their child in a group before
/// appending the suffix, and schema nodes delegate to the schema compiler.
pub fn to_regex(term: &Term) -> Result<String> {
    match term {
        Term::Literal(s) => Ok(regex::escape(s)),
        Term::Regex(pattern) => Ok(format!("({pattern})")),
        Term::JsonSchema {
            schema,
            whitespace_pattern,
        } => {
            let inner =
                json_schema::regex_from_value(schema, whitespace_pattern.as_deref(), None)?;
            Ok(format!("({inner})"))
        }
        Term::KleeneStar(inner) => Ok(format!("({})*", to_regex(inner)?)),
        Term::KleenePlus(inner) => Ok(format!("({})+", to_regex(inner)?)),
        Term::Optional(inner) => Ok(format!("({})?", to_regex(inner)?)),
        Term::Alternatives(terms) => {
            if terms.is_empty() {
                return Err(Error::EmptyAlternation);
            }
            let lowered: Result<Vec<String>> = terms.iter().map(to_regex).collect();
            Ok(format!("({})", lowered?.join("|")))
        }
        Term::Sequence(terms) => {
            if terms.is_empty() {
                return Err(Error::EmptyAlternation);
            }
            let lowered: Result<Vec<String>> = terms.iter().map(to_regex).collect();
            Ok(lowered?.concat())
        }
        Term::QuantifyExact(inner, n) => Ok(format!("({}){{{n}}}", to_regex(inner)?)),
        Term::QuantifyMinimum(inner, m) => Ok(format!("({}){{{m},}}", to_regex(inner)?)),
        Term::QuantifyMaximum(inner, n) => Ok(format!("({}){{0,{n}}}", to_regex(inner)?)),
        Term::QuantifyBetween(inner, m, n) => {
            if m > n {
                return Err(Error::InvalidQuantifier { min: *m, max: *n });
            }
            Ok(format!("({}){{{m},{n}}}", to_regex(inner)?))
        }
        Term::Fsm(pattern) => Ok(format!("({pattern})")),
    }
}

/// Renders the term tree with box-drawing glyphs.
pub fn pretty_print(term: &Term) -> String {
    printer::render(term)
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", pretty_print(self))
    }
}
