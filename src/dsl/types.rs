//! Maps native type descriptors to terms matching their JSON encoding.

use serde_json::Value;

use super::Term;
use crate::json_schema::types::{BOOLEAN, INTEGER, NULL, NUMBER, STRING, WHITESPACE};
use crate::{Error, Result, SchemaError};

/// Structural nesting cap for type descriptors.
const MAX_DEPTH: usize = 10;

/// A host-language type, described structurally.
///
/// Each descriptor maps to a [`Term`] that matches the JSON encoding of
/// values of that type: a `List` of `Int` matches `[1, 2]`, a
/// `Map(String, Bool)` matches `{"a": true}`, and so on.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeExpr {
    Bool,
    Int,
    Float,
    String,
    /// One of a fixed set of scalar values.
    Literal(Vec<Value>),
    List(Box<TypeExpr>),
    Map(Box<TypeExpr>, Box<TypeExpr>),
    Union(Vec<TypeExpr>),
    Tuple(Vec<TypeExpr>),
    /// The value or `null`.
    Optional(Box<TypeExpr>),
}

/// Builds the term matching the JSON encoding of a type descriptor.
///
/// Fails with `RecursionLimit` when descriptors nest deeper than ten
/// levels, and with `EmptyAlternation` on empty unions, tuples, or literal
/// sets.
pub fn term_from_type(ty: &TypeExpr) -> Result<Term> {
    term_at_depth(ty, 0)
}

fn term_at_depth(ty: &TypeExpr, depth: usize) -> Result<Term> {
    if depth > MAX_DEPTH {
        return Err(Error::RecursionLimit(MAX_DEPTH));
    }
    match ty {
        TypeExpr::Bool => Ok(Term::Regex(BOOLEAN.to_string())),
        TypeExpr::Int => Ok(Term::Regex(INTEGER.to_string())),
        TypeExpr::Float => Ok(Term::Regex(NUMBER.to_string())),
        TypeExpr::String => Ok(Term::Regex(STRING.to_string())),
        TypeExpr::Literal(values) => {
            if values.is_empty() {
                return Err(Error::EmptyAlternation);
            }
            let encoded: Result<Vec<Term>> = values
                .iter()
                .map(|value| match value {
                    Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                        let json = serde_json::to_string(value).map_err(SchemaError::from)?;
                        Ok(Term::Literal(json))
                    }
                    other => Err(SchemaError::UnsupportedConstDataType(Box::new(
                        other.clone(),
                    ))
                    .into()),
                })
                .collect();
            Ok(Term::Alternatives(encoded?))
        }
        TypeExpr::List(item) => {
            let item = term_at_depth(item, depth + 1)?;
            let rest = Term::Sequence(vec![
                Term::Literal(",".to_string()),
                ws(),
                item.clone(),
            ])
            .zero_or_more();
            Ok(Term::Sequence(vec![
                Term::Literal("[".to_string()),
                ws(),
                Term::Sequence(vec![item, rest]).optional(),
                ws(),
                Term::Literal("]".to_string()),
            ]))
        }
        TypeExpr::Map(key, value) => {
            let key = term_at_depth(key, depth + 1)?;
            let value = term_at_depth(value, depth + 1)?;
            let entry = Term::Sequence(vec![
                key,
                ws(),
                Term::Literal(":".to_string()),
                ws(),
                value,
            ]);
            let rest = Term::Sequence(vec![
                ws(),
                Term::Literal(",".to_string()),
                ws(),
                entry.clone(),
            ])
            .zero_or_more();
            Ok(Term::Sequence(vec![
                Term::Literal("{".to_string()),
                ws(),
                Term::Sequence(vec![entry, rest]).optional(),
                ws(),
                Term::Literal("}".to_string()),
            ]))
        }
        TypeExpr::Union(members) => {
            if members.is_empty() {
                return Err(Error::EmptyAlternation);
            }
            let members: Result<Vec<Term>> = members
                .iter()
                .map(|member| term_at_depth(member, depth + 1))
                .collect();
            Ok(Term::Alternatives(members?))
        }
        TypeExpr::Tuple(elements) => {
            if elements.is_empty() {
                return Err(Error::EmptyAlternation);
            }
            let mut parts = vec![Term::Literal("[".to_string()), ws()];
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    parts.push(ws());
                    parts.push(Term::Literal(",".to_string()));
                    parts.push(ws());
                }
                parts.push(term_at_depth(element, depth + 1)?);
            }
            parts.push(ws());
            parts.push(Term::Literal("]".to_string()));
            Ok(Term::Sequence(parts))
        }
        TypeExpr::Optional(inner) => Ok(Term::Alternatives(vec![
            term_at_depth(inner, depth + 1)?,
            Term::Regex(NULL.to_string()),
        ])),
    }
}

fn ws() -> Term {
    Term::Regex(WHITESPACE.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn matches(ty: &TypeExpr, s: &str) -> bool {
        term_from_type(ty)
            .expect("Term failed")
            .matches(s)
            .expect("Match failed")
    }

    #[test]
    fn scalar_descriptors() {
        assert!(matches(&TypeExpr::Int, "-42"));
        assert!(!matches(&TypeExpr::Int, "4.2"));
        assert!(matches(&TypeExpr::Float, "4.2"));
        assert!(matches(&TypeExpr::Bool, "true"));
        assert!(matches(&TypeExpr::String, r#""hi""#));
        assert!(!matches(&TypeExpr::String, "hi"));
    }

    #[test]
    fn list_of_ints() {
        let ty = TypeExpr::List(Box::new(TypeExpr::Int));
        assert!(matches(&ty, "[]"));
        assert!(matches(&ty, "[1]"));
        assert!(matches(&ty, "[1, 2, 3]"));
        assert!(!matches(&ty, "[1, ]"));
        assert!(!matches(&ty, r#"["a"]"#));
    }

    #[test]
    fn map_of_string_to_bool() {
        let ty = TypeExpr::Map(Box::new(TypeExpr::String), Box::new(TypeExpr::Bool));
        assert!(matches(&ty, "{}"));
        assert!(matches(&ty, r#"{"a": true}"#));
        assert!(matches(&ty, r#"{"a": true, "b": false}"#));
        assert!(!matches(&ty, r#"{"a": 1}"#));
    }

    #[test]
    fn tuple_is_fixed_length() {
        let ty = TypeExpr::Tuple(vec![TypeExpr::String, TypeExpr::Int]);
        assert!(matches(&ty, r#"["a", 1]"#));
        assert!(!matches(&ty, r#"["a"]"#));
        assert!(!matches(&ty, r#"["a", 1, 2]"#));
    }

    #[test]
    fn union_and_optional() {
        let ty = TypeExpr::Union(vec![TypeExpr::Int, TypeExpr::Bool]);
        assert!(matches(&ty, "1"));
        assert!(matches(&ty, "false"));
        assert!(!matches(&ty, r#""x""#));

        let ty = TypeExpr::Optional(Box::new(TypeExpr::Int));
        assert!(matches(&ty, "1"));
        assert!(matches(&ty, "null"));
    }

    #[test]
    fn literal_values_are_json_encoded() {
        let ty = TypeExpr::Literal(vec![json!("on"), json!("off"), json!(3)]);
        assert!(matches(&ty, r#""on""#));
        assert!(matches(&ty, "3"));
        assert!(!matches(&ty, "on"));
    }

    #[test]
    fn nesting_is_depth_limited() {
        let mut ty = TypeExpr::Int;
        for _ in 0..=MAX_DEPTH {
            ty = TypeExpr::List(Box::new(ty));
        }
        match term_from_type(&ty) {
            Err(Error::RecursionLimit(limit)) => assert_eq!(limit, MAX_DEPTH),
            other => unreachable!("expected recursion limit, got {other:?}"),
        }

        // One level less is fine.
        let mut ty = TypeExpr::Int;
        for _ in 0..MAX_DEPTH {
            ty = TypeExpr::List(Box::new(ty));
        }
        term_from_type(&ty).expect("Term failed");
    }
}
