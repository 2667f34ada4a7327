//! The token ↔ id mapping of a language model, with a distinguished EOS id.

use bincode::{Decode, Encode};
use rustc_hash::FxHashMap as HashMap;

use crate::prelude::*;
use crate::{Error, Result};

pub mod processor;

/// `Vocabulary` of a large language model.
///
/// Maps token bytes to the set of ids the tokenizer assigns them; several
/// ids may share one surface form. The EOS id has no byte form and can
/// never be inserted as an ordinary token.
///
/// ## Examples
///
/// ```rust
/// use tokenrail::prelude::*;
///
/// let eos_token_id = 1;
/// let mut vocabulary = Vocabulary::new(eos_token_id);
///
/// vocabulary.try_insert("token", 0).expect("New token inserted");
/// assert_eq!(vocabulary.token_ids("token"), Some(&vec![0]));
/// assert_eq!(vocabulary.eos_token_id(), eos_token_id);
///
/// vocabulary.remove("token");
/// assert_eq!(vocabulary.token_ids("token"), None);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Encode, Decode)]
pub struct Vocabulary {
    eos_token_id: TokenId,
    tokens: HashMap<Token, Vec<TokenId>>,
}

impl Vocabulary {
    /// Creates an empty vocabulary.
    pub fn new(eos_token_id: TokenId) -> Self {
        Self {
            eos_token_id,
            tokens: HashMap::default(),
        }
    }

    /// Builds the vocabulary of an already-loaded `tokenizers::Tokenizer`.
    ///
    /// Token display forms are normalised to bytes according to the
    /// tokenizer's processing level, see [`processor`]. The EOS id itself is
    /// skipped; special added tokens are skipped as well.
    #[cfg(feature = "hugging-face")]
    pub fn from_tokenizer(
        tokenizer: &tokenizers::Tokenizer,
        eos_token_id: TokenId,
    ) -> Result<Self> {
        let level = processor::ProcessorLevel::detect(tokenizer.get_vocab(false).keys());
        let token_processor = processor::TokenProcessor::new(level);

        let mut vocabulary = Vocabulary::new(eos_token_id);
        for (id, added_token) in tokenizer.get_added_tokens_decoder().iter() {
            if !added_token.special && *id != eos_token_id {
                vocabulary.try_insert(added_token.content.clone(), *id)?;
            }
        }
        for (token, token_id) in tokenizer.get_vocab(false) {
            if token_id != eos_token_id {
                let token_bytes = token_processor.process(&token)?;
                vocabulary.try_insert(token_bytes, token_id)?;
            }
        }
        Ok(vocabulary)
    }

    /// All tokens with their token ids.
    pub fn tokens(&self) -> &HashMap<Token, Vec<TokenId>> {
        &self.tokens
    }

    /// The ids assigned to a token, if it is in the vocabulary.
    pub fn token_ids(&self, token: impl AsRef<[u8]>) -> Option<&Vec<TokenId>> {
        self.tokens.get(token.as_ref())
    }

    /// The bytes of the token carrying a given id, if any.
    pub fn token_by_id(&self, token_id: TokenId) -> Option<&Token> {
        self.tokens
            .iter()
            .find(|(_, ids)| ids.contains(&token_id))
            .map(|(token, _)| token)
    }

    /// Identifier of the end-of-sequence token.
    pub fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    /// Inserts a token with the given identifier.
    pub fn try_insert(&mut self, token: impl Into<Token>, id: TokenId) -> Result<(), Error> {
        if id == self.eos_token_id {
            return Err(Error::EosTokenDisallowed);
        }
        let token = token.into();
        self.tokens.entry(token).or_default().push(id);
        Ok(())
    }

    /// Removes a token and all of its ids.
    pub fn remove(&mut self, token: impl Into<Token>) {
        let token = token.into();
        self.tokens.remove(&token);
    }

    /// Number of distinct token ids, the EOS id included.
    pub fn len(&self) -> usize {
        self.tokens.values().map(|ids| ids.len()).sum::<usize>() + 1
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl std::fmt::Display for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Vocabulary object with eos_token_id={:?} and the following tokens to token_ids:",
            self.eos_token_id
        )?;
        for (token, token_ids) in self.tokens.iter() {
            writeln!(
                f,
                "{:?} -> {:?}",
                token
                    .iter()
                    .map(|b| format!("0x{:02X}", b))
                    .collect::<Vec<_>>(),
                token_ids
            )?;
        }
        Ok(())
    }
}

impl TryFrom<(TokenId, HashMap<Token, Vec<TokenId>>)> for Vocabulary {
    type Error = Error;

    fn try_from(values: (TokenId, HashMap<Token, Vec<TokenId>>)) -> Result<Self, Self::Error> {
        let (eos_token_id, tokens) = values;
        if tokens.iter().any(|(_, ids)| ids.contains(&eos_token_id)) {
            return Err(Error::EosTokenDisallowed);
        }
        Ok(Vocabulary {
            eos_token_id,
            tokens,
        })
    }
}

impl TryFrom<(TokenId, HashMap<String, Vec<TokenId>>)> for Vocabulary {
    type Error = Error;

    fn try_from(values: (TokenId, HashMap<String, Vec<TokenId>>)) -> Result<Self, Self::Error> {
        let (eos_token_id, tokens) = values;
        Ok(Vocabulary {
            eos_token_id,
            tokens: tokens
                .into_iter()
                .map(|(token, ids)| {
                    if ids.contains(&eos_token_id) {
                        Err(Error::EosTokenDisallowed)
                    } else {
                        Ok((token.as_bytes().to_vec(), ids))
                    }
                })
                .collect::<Result<HashMap<Token, Vec<TokenId>>, _>>()?,
        })
    }
}
