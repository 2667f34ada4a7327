//! Library's interface essentials.

pub use super::{
    dsl::{self, Term},
    guide::{Guide, Instruction},
    index::Index,
    json_schema,
    primitives::{StateId, Token, TokenId},
    processor::{BackendKind, CpuBackend, GuideLogitsProcessor},
    vocabulary::Vocabulary,
};
