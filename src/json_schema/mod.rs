//! Generates a regular expression from a JSON schema.
//!
//! An optional whitespace pattern can be supplied to control the whitespace
//! between structural elements; when `None`, the default [`WHITESPACE`]
//! pattern is used. An optional recursion ceiling bounds how far local
//! `$ref` cycles are unrolled (default 3).
//!
//! Returns an error if the schema is invalid JSON or uses a feature that
//! cannot be expressed as a regular expression.
//!
//! ## Supported features
//!
//! ### Common
//! - `type` — a type name, or an array of type names (untagged union)
//! - `enum` — the allowed values
//! - `const` — a single allowed value
//!
//! ### Object
//! - `properties`, `required`
//! - `additionalProperties`
//! - `minProperties`, `maxProperties`
//!
//! ### Array
//! - `items`, `prefixItems`
//! - `minItems`, `maxItems`
//!
//! ### String
//! - `minLength`, `maxLength`
//! - `pattern`
//! - `format` — the names in [`FormatType`]
//!
//! ### Number / integer
//! - `minDigitsInteger`, `maxDigitsInteger`, `minDigitsFraction`,
//!   `maxDigitsFraction`, `minDigitsExponent`, `maxDigitsExponent`
//! - `minDigits`, `maxDigits`
//!
//! ### Logical
//! - `allOf`, `anyOf`, `oneOf`
//!
//! ### References
//!
//! Only local references are supported (`#/...`, `$defs`, `definitions`,
//! or an `$id`-qualified local fragment). Recursive references are unrolled
//! up to the recursion ceiling; raising it should be done cautiously since
//! the pattern size of a self-referential schema grows exponentially with
//! each level.
//!
//! ### Unconstrained schemas
//!
//! An empty object schema is unconstrained and admits any JSON value.

use serde_json::Value;
pub use types::*;

mod parsing;
pub mod types;

use crate::error::Result;

/// Generates a regular expression string from a JSON schema string.
///
/// # Example
///
/// ```rust
/// # use tokenrail::Error;
/// use tokenrail::prelude::*;
///
/// # fn main() -> Result<(), Error> {
/// let schema = r#"{
///     "type": "object",
///     "properties": {
///         "name": { "type": "string" },
///         "age": { "type": "integer" }
///     },
///     "required": ["name", "age"]
/// }"#;
///
/// let regex = json_schema::regex_from_str(schema, None, None)?;
///
/// // A custom whitespace pattern can be passed as well
/// let regex = json_schema::regex_from_str(schema, Some(r#"[\n ]*"#), None)?;
/// # let _ = regex;
/// # Ok(())
/// # }
/// ```
pub fn regex_from_str(
    json: &str,
    whitespace_pattern: Option<&str>,
    max_recursion_depth: Option<usize>,
) -> Result<String> {
    let json_value: Value = serde_json::from_str(json).map_err(crate::SchemaError::from)?;
    regex_from_value(&json_value, whitespace_pattern, max_recursion_depth)
}

/// Generates a regular expression string from an already-parsed
/// `serde_json::Value` schema.
pub fn regex_from_value(
    json: &Value,
    whitespace_pattern: Option<&str>,
    max_recursion_depth: Option<usize>,
) -> Result<String> {
    let mut compiler = parsing::Compiler::new(json);
    if let Some(pattern) = whitespace_pattern {
        compiler = compiler.with_whitespace_pattern(pattern);
    }
    if let Some(depth) = max_recursion_depth {
        compiler = compiler.with_max_recursion_depth(depth);
    }
    let regex = compiler.compile(json)?;
    tracing::debug!(regex_len = regex.len(), "compiled schema to regex");
    Ok(regex)
}
