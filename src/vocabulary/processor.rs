//! Normalises tokenizer display forms into the raw bytes the model emits.
//!
//! Tokenizers rarely store plain bytes. Byte-level BPE tokenizers (the GPT-2
//! family) remap every byte to a printable character, so a leading space
//! shows up as `Ġ`. SentencePiece-style tokenizers with byte fallback (the
//! Llama family) mark a leading space with `▁` and spell raw bytes as
//! `<0xNN>` placeholder tokens. The automaton walks real bytes, so both
//! encodings have to be undone before a token can enter the vocabulary.

use rustc_hash::FxHashMap as HashMap;

use crate::primitives::Token;
use crate::{Error, Result};

/// How a tokenizer spells its tokens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProcessorLevel {
    /// Raw bytes, nothing to undo.
    Raw,
    /// Byte-level BPE remapping, one printable char per byte.
    Byte,
    /// SentencePiece byte fallback: `▁` for space, `<0xNN>` for raw bytes.
    ByteFallback,
}

impl ProcessorLevel {
    /// Guesses the level from the vocabulary's surface forms.
    ///
    /// Byte-fallback vocabularies contain the `<0xNN>` placeholders;
    /// byte-level ones contain the remapped space `Ġ`.
    pub fn detect<'a>(tokens: impl Iterator<Item = &'a String>) -> Self {
        let mut saw_byte_level_space = false;
        for token in tokens {
            if is_byte_placeholder(token) || token.starts_with('▁') {
                return ProcessorLevel::ByteFallback;
            }
            if token.contains('Ġ') {
                saw_byte_level_space = true;
            }
        }
        if saw_byte_level_space {
            ProcessorLevel::Byte
        } else {
            ProcessorLevel::Raw
        }
    }
}

/// Translates one display form into token bytes.
pub struct TokenProcessor {
    level: ProcessorLevel,
    char_to_byte: HashMap<char, u8>,
}

impl TokenProcessor {
    pub fn new(level: ProcessorLevel) -> Self {
        Self {
            level,
            char_to_byte: byte_level_char_map(),
        }
    }

    pub fn level(&self) -> ProcessorLevel {
        self.level
    }

    /// The byte sequence a display form stands for.
    pub fn process(&self, token: &str) -> Result<Token> {
        match self.level {
            ProcessorLevel::Raw => Ok(token.as_bytes().to_vec()),
            ProcessorLevel::Byte => token
                .chars()
                .map(|c| {
                    self.char_to_byte.get(&c).copied().ok_or_else(|| {
                        Error::UnsupportedTokenizer {
                            reason: format!("byte-level token carries unmapped char {c:?}"),
                        }
                    })
                })
                .collect(),
            ProcessorLevel::ByteFallback => {
                if let Some(byte) = parse_byte_placeholder(token) {
                    return Ok(vec![byte]);
                }
                // `▁`-prefixed tokens and `▁` runs denote spaces.
                Ok(token.replace('▁', " ").into_bytes())
            }
        }
    }
}

fn is_byte_placeholder(token: &str) -> bool {
    parse_byte_placeholder(token).is_some()
}

/// `<0xNN>` → `NN`, the byte-fallback spelling of a raw byte.
fn parse_byte_placeholder(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// The byte-level BPE bijection between bytes and printable characters.
///
/// Printable latin-1 bytes map to themselves; the remaining bytes are
/// assigned consecutive codepoints from U+0100 up, which is how `Ġ` comes
/// to stand for the space byte.
fn byte_level_char_map() -> HashMap<char, u8> {
    let mut map = HashMap::default();
    let mut offset = 0u32;
    for byte in 0..=255u8 {
        let printable = (b'!'..=b'~').contains(&byte)
            || (0xA1..=0xAC).contains(&byte)
            || (0xAE..=0xFF).contains(&byte);
        let c = if printable {
            char::from_u32(byte as u32).expect("latin-1 codepoint")
        } else {
            let c = char::from_u32(0x100 + offset).expect("remapped codepoint");
            offset += 1;
            c
        };
        map.insert(c, byte);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_level_space_is_g_with_breve() {
        let processor = TokenProcessor::new(ProcessorLevel::Byte);
        assert_eq!(processor.process("Ġal").expect("Process failed"), b" al");
        assert_eq!(processor.process("abc").expect("Process failed"), b"abc");
        assert_eq!(processor.process("ĠO").expect("Process failed"), b" O");
    }

    #[test]
    fn byte_level_round_trips_every_byte() {
        let map = byte_level_char_map();
        assert_eq!(map.len(), 256);
        let mut seen = [false; 256];
        for &byte in map.values() {
            assert!(!seen[byte as usize], "byte {byte} mapped twice");
            seen[byte as usize] = true;
        }
    }

    #[test]
    fn byte_fallback_spellings() {
        let processor = TokenProcessor::new(ProcessorLevel::ByteFallback);
        // Leading-space forms of the Llama family.
        assert_eq!(processor.process("▁al").expect("Process failed"), b" al");
        assert_eq!(processor.process("▁▁▁").expect("Process failed"), b"   ");
        assert_eq!(processor.process("<0x20>").expect("Process failed"), b" ");
        assert_eq!(
            processor.process("<0xFF>").expect("Process failed"),
            vec![0xFF]
        );
        assert_eq!(processor.process("abc").expect("Process failed"), b"abc");
    }

    #[test]
    fn malformed_placeholders_pass_through() {
        let processor = TokenProcessor::new(ProcessorLevel::ByteFallback);
        assert_eq!(
            processor.process("<0xZZ>").expect("Process failed"),
            b"<0xZZ>"
        );
        assert_eq!(
            processor.process("<0x123>").expect("Process failed"),
            b"<0x123>"
        );
    }

    #[test]
    fn level_detection() {
        let byte_fallback = vec!["<0x00>".to_string(), "▁the".to_string()];
        assert_eq!(
            ProcessorLevel::detect(byte_fallback.iter()),
            ProcessorLevel::ByteFallback
        );

        let byte_level = vec!["Ġthe".to_string(), "abc".to_string()];
        assert_eq!(
            ProcessorLevel::detect(byte_level.iter()),
            ProcessorLevel::Byte
        );

        let raw = vec!["the".to_string(), "abc".to_string()];
        assert_eq!(ProcessorLevel::detect(raw.iter()), ProcessorLevel::Raw);
    }
}
