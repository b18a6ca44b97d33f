//! # llama-engine
//!
//! The "narrow waist" of the llama-gen stack. Defines the [`Runtime`] trait that
//! every inference backend implements, the per-request [`GenerationConfig`], the
//! load-time [`ModelParams`] and the [`LlamaError`] taxonomy that all other crates
//! report through.
//!
//! ## Design Notes
//!
//! ### Runtime as a black box
//! Tokenization, the forward pass, logits, embeddings and the serialized session
//! state all belong to the runtime. The generation engine only sequences calls
//! into it: feed a batch, read logits, pick a token, feed it back.
//!
//! ### Exclusive access
//! Methods that advance the runtime (`decode`, `state_set`) take `&mut self`.
//! One generation call owns the runtime for its whole duration, so two calls can
//! never interleave decodes on the same working set.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility with llama.cpp-style
//! runtimes, though token IDs are logically non-negative.

pub mod config;
pub mod params;

pub use config::{parse_logit_bias, GenerationConfig, LogitBias, MirostatMode};
pub use params::{parse_tensor_split, ModelParams};

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Top-level error type for all engine operations.
///
/// Cancellation is deliberately absent: a caller stopping generation ends the
/// call normally with the output produced so far.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    /// Invalid or unparseable configuration, including grammar strings.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Empty prompt without a BOS fallback, or a prompt too long for the context.
    #[error("Tokenization failed: {0}")]
    Tokenize(String),
    /// Forward-pass failure, or no token could be selected from its logits.
    /// Fatal for the call; never retried.
    #[error("Decode failed: {0}")]
    Decode(String),
    /// Snapshot size mismatch or the runtime refused a state buffer.
    #[error("Session state error: {0}")]
    State(String),
    #[error("Embedding extraction failed: {0}")]
    Embedding(String),
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static description of a loaded model.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ModelInfo {
    pub vocab_size: usize,
    /// Context length the model was trained with.
    pub context_length: usize,
    pub embedding_size: usize,
    pub layer_count: usize,
    /// Size of the weights in bytes.
    pub model_size: u64,
    pub param_count: u64,
    pub description: String,
}

/// The core runtime trait: everything the generation engine needs from a model.
///
/// Implementations own both the model weights and the context (KV cache,
/// logits, embeddings). Dropping the implementation releases both together.
pub trait Runtime: Send {
    /// Convert text into token IDs. `add_special` prepends BOS when the model wants it.
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>>;

    /// Render a single token as a text fragment.
    fn token_to_piece(&self, token: TokenId) -> Result<String>;

    /// Run the forward pass over `batch`, placing its first token at position `n_past`.
    ///
    /// Any state the runtime holds for positions `>= n_past` is discarded first.
    fn decode(&mut self, batch: &[TokenId], n_past: usize) -> Result<()>;

    /// Logits for the last token of the most recent decode, `n_vocab` long.
    fn logits(&self) -> Option<&[f32]>;

    /// Embedding output of the most recent decode, `n_embd` long.
    fn embeddings(&self) -> Option<&[f32]>;

    /// Exact number of bytes needed to hold the full session state.
    fn state_size(&self) -> usize;

    /// Copy the session state into `dst`. Returns the number of bytes written.
    fn state_get(&self, dst: &mut [u8]) -> usize;

    /// Replace the session state from `src`. Returns the number of bytes read,
    /// or 0 if the buffer is not a valid state for this runtime.
    fn state_set(&mut self, src: &[u8]) -> usize;

    /// Context capacity of this runtime instance, in tokens.
    fn n_ctx(&self) -> usize;

    /// Context length the model was trained with.
    fn n_ctx_train(&self) -> usize {
        self.n_ctx()
    }

    fn n_vocab(&self) -> usize;

    fn n_embd(&self) -> usize;

    /// Beginning-of-sequence token, if the vocabulary has one.
    fn token_bos(&self) -> Option<TokenId>;

    /// Whether tokenization should prepend BOS by default.
    fn add_bos(&self) -> bool;

    /// End-of-generation check (EOS, EOT and friends).
    fn is_eog(&self, token: TokenId) -> bool;

    /// All end-of-generation tokens of the vocabulary.
    fn eog_tokens(&self) -> Vec<TokenId>;

    /// Whether the context was created with embedding output enabled.
    fn embeddings_enabled(&self) -> bool;

    /// Worker-thread count for the forward pass. Opaque to the engine.
    fn set_n_threads(&mut self, _n_threads: usize) {}

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            vocab_size: self.n_vocab(),
            context_length: self.n_ctx_train(),
            embedding_size: self.n_embd(),
            ..ModelInfo::default()
        }
    }
}

impl<R: Runtime + ?Sized> Runtime for Box<R> {
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>> {
        (**self).tokenize(text, add_special)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<String> {
        (**self).token_to_piece(token)
    }

    fn decode(&mut self, batch: &[TokenId], n_past: usize) -> Result<()> {
        (**self).decode(batch, n_past)
    }

    fn logits(&self) -> Option<&[f32]> {
        (**self).logits()
    }

    fn embeddings(&self) -> Option<&[f32]> {
        (**self).embeddings()
    }

    fn state_size(&self) -> usize {
        (**self).state_size()
    }

    fn state_get(&self, dst: &mut [u8]) -> usize {
        (**self).state_get(dst)
    }

    fn state_set(&mut self, src: &[u8]) -> usize {
        (**self).state_set(src)
    }

    fn n_ctx(&self) -> usize {
        (**self).n_ctx()
    }

    fn n_ctx_train(&self) -> usize {
        (**self).n_ctx_train()
    }

    fn n_vocab(&self) -> usize {
        (**self).n_vocab()
    }

    fn n_embd(&self) -> usize {
        (**self).n_embd()
    }

    fn token_bos(&self) -> Option<TokenId> {
        (**self).token_bos()
    }

    fn add_bos(&self) -> bool {
        (**self).add_bos()
    }

    fn is_eog(&self, token: TokenId) -> bool {
        (**self).is_eog(token)
    }

    fn eog_tokens(&self) -> Vec<TokenId> {
        (**self).eog_tokens()
    }

    fn embeddings_enabled(&self) -> bool {
        (**self).embeddings_enabled()
    }

    fn set_n_threads(&mut self, n_threads: usize) {
        (**self).set_n_threads(n_threads)
    }

    fn model_info(&self) -> ModelInfo {
        (**self).model_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_kind() {
        let err = LlamaError::Decode("kv slot unavailable".into());
        assert_eq!(err.to_string(), "Decode failed: kv slot unavailable");

        let err = LlamaError::State("expected 64 bytes, read 12".into());
        assert!(err.to_string().starts_with("Session state error"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LlamaError = io.into();
        assert!(matches!(err, LlamaError::Io(_)));
    }

    #[test]
    fn model_info_default_is_empty() {
        let info = ModelInfo::default();
        assert_eq!(info.vocab_size, 0);
        assert!(info.description.is_empty());
    }
}
