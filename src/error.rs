use thiserror::Error;

use crate::primitives::{StateId, TokenId};

pub type Result<T, E = crate::Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("EOS token should not be inserted into the vocabulary")]
    EosTokenDisallowed,
    #[error("the automaton has no anchored start state")]
    DfaHasNoStartState,
    #[error("the pattern could not be compiled into an automaton: {0}")]
    DfaBuild(#[from] Box<regex_automata::dfa::dense::BuildError>),
    #[error("the pattern matches no sequence over the vocabulary")]
    EmptyLanguage,
    #[error("no transition out of state {state} on token id {token_id}")]
    InvalidTransition { state: StateId, token_id: TokenId },
    #[error("cannot roll back {requested} steps, only {available} recorded")]
    InvalidRollback { requested: usize, available: usize },
    #[error("guide is stuck in state {0} with no outgoing transition")]
    GuideStuck(StateId),
    #[error("batch size mismatch: generated ids carry {ids} rows, logits carry {logits}")]
    ShapeMismatch { ids: usize, logits: usize },
    #[error("no tensor backend registered under the name '{0}'")]
    BackendUnavailable(Box<str>),
    #[error("tensor backend failure: {0}")]
    Backend(String),
    #[error("'{input}' does not match '{pattern}'")]
    PatternMismatch { input: String, pattern: String },
    #[error("the lowered pattern could not be compiled: {0}")]
    PatternCompile(#[from] regex::Error),
    #[error("alternation and sequence terms need at least one element")]
    EmptyAlternation,
    #[error("quantifier bounds are inverted: min {min} > max {max}")]
    InvalidQuantifier { min: usize, max: usize },
    #[error("type descriptor nesting exceeds the depth limit of {0}")]
    RecursionLimit(usize),
    #[error("tokenizer is not supported: {reason}")]
    UnsupportedTokenizer { reason: String },
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("serde json error")]
    SerdeJson(#[from] serde_json::Error),
    #[error("unsupported JSON Schema structure {0}: check that the schema is valid and uses supported keywords")]
    UnsupportedSchema(Box<serde_json::Value>),
    #[error("'properties' not found or not an object")]
    PropertiesNotFound,
    #[error("'allOf' must be a non-empty array")]
    AllOfMustBeAnArray,
    #[error("'anyOf' must be a non-empty array")]
    AnyOfMustBeAnArray,
    #[error("'oneOf' must be a non-empty array")]
    OneOfMustBeAnArray,
    #[error("'prefixItems' must be an array")]
    PrefixItemsMustBeAnArray,
    #[error("'enum' must be an array")]
    EnumMustBeAnArray,
    #[error("unsupported data type in const: {0}")]
    UnsupportedConstDataType(Box<serde_json::Value>),
    #[error("'const' key not found in object")]
    ConstKeyNotFound,
    #[error("'$ref' must be a string")]
    RefMustBeAString,
    #[error("external references are not supported: {0}")]
    ExternalReference(Box<str>),
    #[error("invalid reference format: {0}")]
    InvalidReferenceFormat(Box<str>),
    #[error("invalid reference path: {0}")]
    InvalidReferencePath(Box<str>),
    #[error("'type' must be a string or an array of strings")]
    TypeMustBeAString,
    #[error("unsupported type: {0}")]
    UnsupportedType(Box<str>),
    #[error("max bound must be greater than or equal to min bound")]
    MaxBound,
    #[error("string format '{0}' is not supported")]
    UnsupportedFormat(Box<str>),
    #[error("reference recursion limit reached: {0}")]
    RefRecursionLimit(usize),
}

impl SchemaError {
    /// Recursion-limit errors are droppable in branches a caller can elide,
    /// e.g. an optional property referencing its enclosing schema.
    pub fn is_recursion_limit(&self) -> bool {
        matches!(self, Self::RefRecursionLimit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_bridges_into_crate_error() {
        let err: Error = SchemaError::ConstKeyNotFound.into();
        assert_eq!(err.to_string(), "'const' key not found in object");
    }

    #[test]
    fn recursion_limit_is_droppable() {
        assert!(SchemaError::RefRecursionLimit(3).is_recursion_limit());
        assert!(!SchemaError::ConstKeyNotFound.is_recursion_limit());
    }
}
