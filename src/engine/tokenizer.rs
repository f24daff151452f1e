//! HuggingFace `tokenizers` backed text codec.

use std::path::Path;

use tokenizers::Tokenizer;

use super::{TextCodec, TokenId};
use crate::error::{Error, Result};

/// Tokenizer loaded from a `tokenizer.json`.
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    /// Load a tokenizer from file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            Error::Tokenization(format!(
                "failed to load {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self { inner })
    }

    /// Look up a token id by its literal text (e.g. `"</s>"`).
    pub fn token_id(&self, token: &str) -> Option<TokenId> {
        self.inner.token_to_id(token)
    }
}

impl TextCodec for HfTokenizer {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, add_special)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        self.inner
            .decode(tokens, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }
}
