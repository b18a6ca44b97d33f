//! Embedding extraction.

use llama_engine::{LlamaError, Result, TokenId};
use tracing::debug;

use crate::session::Session;

/// What to embed. Token input is rendered back to text and re-tokenized so
/// both forms go through the same path.
#[derive(Debug, Clone, Copy)]
pub enum EmbeddingInput<'a> {
    Text(&'a str),
    Tokens(&'a [TokenId]),
}

impl<'a> From<&'a str> for EmbeddingInput<'a> {
    fn from(text: &'a str) -> Self {
        EmbeddingInput::Text(text)
    }
}

impl<'a> From<&'a [TokenId]> for EmbeddingInput<'a> {
    fn from(tokens: &'a [TokenId]) -> Self {
        EmbeddingInput::Tokens(tokens)
    }
}

impl Session {
    /// Decode the input in one pass from position 0 and return `n_embd` values.
    pub fn embed<'a>(&mut self, input: impl Into<EmbeddingInput<'a>>) -> Result<Vec<f32>> {
        if !self.runtime().embeddings_enabled() {
            return Err(LlamaError::Embedding(
                "model was loaded without embeddings enabled".into(),
            ));
        }

        let text = match input.into() {
            EmbeddingInput::Text(text) => text.to_string(),
            EmbeddingInput::Tokens(tokens) => self.detokenize(tokens)?,
        };
        let tokens = self.tokenize(&text)?;
        if tokens.is_empty() {
            return Err(LlamaError::Embedding("input produced no tokens".into()));
        }
        let n_ctx = self.n_ctx();
        if tokens.len() > n_ctx {
            return Err(LlamaError::Tokenize(format!(
                "input is {} tokens, context holds {n_ctx}",
                tokens.len()
            )));
        }

        let rt = self.runtime_mut();
        rt.decode(&tokens, 0)?;
        let n_embd = rt.n_embd();
        let embeddings = rt
            .embeddings()
            .ok_or_else(|| LlamaError::Embedding("runtime produced no embeddings".into()))?;
        if embeddings.len() < n_embd {
            return Err(LlamaError::Embedding(format!(
                "runtime returned {} values, expected {n_embd}",
                embeddings.len()
            )));
        }
        debug!(n_tokens = tokens.len(), n_embd, "embedding extracted");
        Ok(embeddings[..n_embd].to_vec())
    }
}
