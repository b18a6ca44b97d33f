//! A generation session: one runtime, one identity.

use llama_engine::{ModelInfo, Result, Runtime, TokenId};
use tracing::{debug, info};
use uuid::Uuid;

/// Owns a loaded model and its context for the session's lifetime.
///
/// The runtime is released exactly once, when the session is dropped. Calls
/// take `&mut self`, so a session serves one caller at a time; move it to
/// another thread (it is `Send`) rather than sharing it.
pub struct Session {
    id: Uuid,
    runtime: Box<dyn Runtime>,
}

impl Session {
    pub fn new<R: Runtime + 'static>(runtime: R) -> Self {
        Self::from_boxed(Box::new(runtime))
    }

    pub fn from_boxed(runtime: Box<dyn Runtime>) -> Self {
        let id = Uuid::new_v4();
        info!(
            session = %id,
            n_ctx = runtime.n_ctx(),
            n_vocab = runtime.n_vocab(),
            "session opened"
        );
        Self { id, runtime }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    pub fn runtime_mut(&mut self) -> &mut dyn Runtime {
        self.runtime.as_mut()
    }

    pub fn n_ctx(&self) -> usize {
        self.runtime.n_ctx()
    }

    pub fn model_info(&self) -> ModelInfo {
        self.runtime.model_info()
    }

    /// Tokenize `text` the way a prompt is tokenized (BOS when the model wants it).
    pub fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        self.runtime.tokenize(text, self.runtime.add_bos())
    }

    /// Render tokens back into text.
    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        let mut text = String::new();
        for &token in tokens {
            text.push_str(&self.runtime.token_to_piece(token)?);
        }
        Ok(text)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(session = %self.id, "session released");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("n_ctx", &self.runtime.n_ctx())
            .finish()
    }
}
