//! # llama-runtime
//!
//! Generation sessions on top of a [`Runtime`](llama_engine::Runtime).
//!
//! A [`Session`] owns one runtime (model and context together) and exposes:
//! - [`Session::generate`]: the streaming decode loop, feeding the prompt in
//!   batches, sampling one token per iteration and pushing each rendered piece
//!   to a [`TokenSink`] until a stop condition, cancellation or an error
//! - [`Session::save_state`] / [`Session::load_state`]: raw snapshots of the
//!   runtime's working state
//! - [`Session::embed`]: single-pass embedding extraction
//! - telemetry hooks (TTFT, tok/s) through [`GenerateOptions`]
//!
//! [`TinyRuntime`] is a small deterministic runtime used by the CLI and tests.

pub mod embed;
pub mod generate;
pub mod session;
pub mod state;
pub mod telemetry;
pub mod tiny;

pub use embed::EmbeddingInput;
pub use generate::{
    Completion, GenerateOptions, GenerationError, StopReason, TerminalState, TokenSink,
};
pub use session::Session;
pub use state::{read_snapshot, restore, snapshot, write_snapshot};
pub use telemetry::{InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, TelemetryHook};
pub use tiny::TinyRuntime;
