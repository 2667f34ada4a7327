//! # tokenrail
//!
//! `tokenrail` keeps an autoregressive language model inside a formal
//! language while it decodes, one token at a time:
//!
//! - describe the language with a regular expression, a JSON Schema, or the
//!   [`dsl`] combinators that lower to a regex
//! - compile the pattern against a tokenizer's [`vocabulary::Vocabulary`]
//!   into an [`index::Index`], a DFA whose alphabet is token ids
//! - drive one [`guide::Guide`] per sequence, or let a
//!   [`processor::GuideLogitsProcessor`] track a whole batch and mask the
//!   forbidden logits to negative infinity every step
//!
//! ## `json_schema`
//!
//! [`json_schema::regex_from_str`] and [`json_schema::regex_from_value`]
//! turn a JSON Schema into a regular expression; the whitespace pattern is
//! customisable and defaults to [`json_schema::WHITESPACE`]. Only a subset
//! of the JSON Schema vocabulary is supported, see the module docs.
//!
//! ## `Index`
//!
//! An `Index` is built once per `(pattern, vocabulary)` pair and shared
//! read-only by any number of guides. Construction cost grows with the
//! complexity of the pattern and the size of the vocabulary; step-time
//! queries are constant-time table lookups.
//!
//! ## Example
//!
//! ```rust
//! # use tokenrail::Error;
//! use tokenrail::prelude::*;
//!
//! # fn main() -> Result<(), Error> {
//! let schema = r#"{
//!     "type": "object",
//!     "properties": {
//!         "name": { "type": "string" },
//!         "age": { "type": "integer" }
//!     },
//!     "required": ["name", "age"]
//! }"#;
//!
//! let regex = json_schema::regex_from_str(schema, None, None)?;
//!
//! let mut vocabulary = Vocabulary::new(3);
//! for (token, id) in [(r#"{"name":"#, 0), (r#""ada","age":"#, 1), ("1}", 2)] {
//!     vocabulary.try_insert(token, id)?;
//! }
//!
//! let index = Index::new(&regex, &vocabulary)?;
//! let mut guide = Guide::new(index.into());
//! assert!(guide.accepts_tokens(&[0, 1, 2]));
//! # Ok(())
//! # }
//! ```

pub mod dsl;
pub mod error;
pub mod guide;
pub mod index;
pub mod json_schema;
pub mod prelude;
pub mod primitives;
pub mod processor;
pub mod vocabulary;

pub use error::{Error, Result, SchemaError};
