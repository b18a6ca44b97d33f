//! Streaming generation sessions over a llama.cpp-style inference runtime.
//!
//! This crate re-exports the workspace: the [`Runtime`] trait and config types
//! from `llama-engine`, the sampler chain from `llama-sampling`, the context
//! window from `llama-kv` and sessions from `llama-runtime`.

pub use llama_engine as engine;
pub use llama_kv as kv;
pub use llama_runtime as runtime;
pub use llama_sampling as sampling;

pub use llama_engine::{
    GenerationConfig, LlamaError, ModelInfo, ModelParams, Result, Runtime, TokenId,
};
pub use llama_kv::{ContextWindow, TokenHistory, WindowShift};
pub use llama_runtime::{
    Completion, EmbeddingInput, GenerateOptions, GenerationError, Session, StopReason,
    TerminalState, TinyRuntime, TokenSink,
};
pub use llama_sampling::{Grammar, SamplerChain, VocabInfo};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
