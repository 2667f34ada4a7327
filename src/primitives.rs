/// Token content, raw bytes as the tokenizer produces them.
pub type Token = Vec<u8>;

/// Token identifier.
pub type TokenId = u32;

/// Identifier of a state in the token-level automaton.
pub type StateId = u32;
