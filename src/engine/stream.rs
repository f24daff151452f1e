//! Incremental detokenization.
//!
//! Tokens do not map to text one by one: byte-fallback pieces only form a
//! character together, and decoders strip or merge across token boundaries.
//! [`OutputStream`] therefore decodes the whole output so far and emits the
//! text past what it already emitted. An output ending in an incomplete
//! UTF-8 sequence emits nothing until the next token completes it.

use super::{TextCodec, TokenId};
use crate::error::Result;

const REPLACEMENT: char = '\u{FFFD}';

/// Generated tokens of one client and how much of their text was emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStream {
    tokens: Vec<TokenId>,
    emitted: usize,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `token` and return the text it adds.
    pub fn push<T: TextCodec + ?Sized>(&mut self, codec: &T, token: TokenId) -> Result<String> {
        self.tokens.push(token);

        let text = codec.detokenize(&self.tokens)?;
        if text.ends_with(REPLACEMENT) {
            return Ok(String::new());
        }

        match text.get(self.emitted..) {
            Some(delta) => {
                let delta = delta.to_string();
                self.emitted = text.len();
                Ok(delta)
            }
            None => Ok(String::new()),
        }
    }

    /// Tokens pushed so far.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// Forget all tokens.
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.emitted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Codec whose tokens are raw bytes, decoded lossily as a whole.
    struct Bytes;

    impl TextCodec for Bytes {
        fn tokenize(&self, text: &str, _add_special: bool) -> Result<Vec<TokenId>> {
            Ok(text.bytes().map(TokenId::from).collect())
        }

        fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
            let bytes: Vec<u8> = tokens.iter().map(|&t| t as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    #[test]
    fn test_ascii_tokens_emit_immediately() {
        let mut stream = OutputStream::new();

        assert_eq!(stream.push(&Bytes, b'h'.into()).unwrap(), "h");
        assert_eq!(stream.push(&Bytes, b'i'.into()).unwrap(), "i");
        assert_eq!(stream.tokens(), &[104, 105]);
    }

    #[test]
    fn test_split_character_waits_for_last_byte() {
        let mut stream = OutputStream::new();

        assert_eq!(stream.push(&Bytes, b'a'.into()).unwrap(), "a");
        assert_eq!(stream.push(&Bytes, 0xC3).unwrap(), "");
        assert_eq!(stream.push(&Bytes, 0xA9).unwrap(), "é");
    }

    #[test]
    fn test_clear_starts_over() {
        let mut stream = OutputStream::new();
        stream.push(&Bytes, b'x'.into()).unwrap();
        stream.clear();

        assert!(stream.tokens().is_empty());
        assert_eq!(stream.push(&Bytes, b'y'.into()).unwrap(), "y");
    }
}
