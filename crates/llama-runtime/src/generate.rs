//! The streaming decode loop.
//!
//! Each iteration either queues the next prompt batch or samples one token,
//! then decodes whatever is pending. Generated pieces go to a [`TokenSink`] as
//! soon as they are rendered. The loop ends on the first of:
//! - a cancellation request or the sink asking to stop
//! - an end-of-generation token (unless `ignore_eos`)
//! - the accumulated text ending with an antiprompt
//! - the `max_tokens` budget running out
//! - an error, which carries the partial output with it

use std::sync::Arc;

use llama_engine::{GenerationConfig, LlamaError, Result, Runtime, TokenId};
use llama_kv::{ContextWindow, TokenHistory};
use llama_sampling::{SamplerChain, VocabInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::session::Session;
use crate::telemetry::{InferenceMetrics, InferenceTimer, NoopTelemetry, TelemetryHook};

/// Tokens reserved at the end of the context when admitting a prompt.
const PROMPT_HEADROOM: usize = 4;

/// Receives each generated piece as it is produced.
pub trait TokenSink {
    /// Return `false` to stop generation. The piece just delivered still
    /// counts toward the output.
    fn on_token(&mut self, piece: &str, token: TokenId) -> bool;
}

impl<F: FnMut(&str) -> bool> TokenSink for F {
    fn on_token(&mut self, piece: &str, _token: TokenId) -> bool {
        self(piece)
    }
}

/// Why a call stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced an end-of-generation token.
    Eos,
    /// The output ended with one of the configured antiprompts.
    Antiprompt,
    /// The `max_tokens` budget ran out.
    MaxTokens,
}

/// Terminal state of a call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Stopped(StopReason),
    /// The caller's token or sink asked to stop.
    Cancelled,
}

impl TerminalState {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TerminalState::Cancelled)
    }
}

/// Result of a generation call.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Concatenation of every delivered piece, untrimmed.
    pub text: String,
    pub tokens: Vec<TokenId>,
    pub state: TerminalState,
    /// The antiprompt that matched, when `state` is `Stopped(Antiprompt)`.
    pub stop_sequence: Option<String>,
    pub stats: InferenceMetrics,
}

impl Completion {
    /// Text as an API would return it: one leading space and one leading
    /// newline removed, and the matched antiprompt cut from the end.
    pub fn trimmed(&self) -> &str {
        let mut text = self.text.as_str();
        text = text.strip_prefix(' ').unwrap_or(text);
        text = text.strip_prefix('\n').unwrap_or(text);
        if let Some(stop) = &self.stop_sequence {
            text = text.strip_suffix(stop.as_str()).unwrap_or(text);
        }
        text
    }
}

/// A failed call, with whatever was generated before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct GenerationError {
    pub source: LlamaError,
    pub partial_text: String,
    pub partial_tokens: Vec<TokenId>,
}

impl GenerationError {
    pub fn into_inner(self) -> LlamaError {
        self.source
    }
}

impl From<GenerationError> for LlamaError {
    fn from(err: GenerationError) -> Self {
        err.source
    }
}

/// Per-call extras beyond the generation config.
#[derive(Clone, Default)]
pub struct GenerateOptions {
    pub cancel: Option<CancellationToken>,
    pub telemetry: Option<Arc<dyn TelemetryHook>>,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = Some(hook);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

impl std::fmt::Debug for GenerateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateOptions")
            .field("cancel", &self.cancel)
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

/// Output accumulated so far; survives a failed call.
#[derive(Default)]
struct Output {
    text: String,
    tokens: Vec<TokenId>,
    stop_sequence: Option<String>,
}

/// Loop bookkeeping for a single call.
struct GenerationState {
    prompt: Vec<TokenId>,
    n_consumed: usize,
    /// `None` means unbounded.
    n_remain: Option<usize>,
    pending: Vec<TokenId>,
    history: TokenHistory,
    window: ContextWindow,
}

impl GenerationState {
    fn new(prompt: Vec<TokenId>, n_ctx: usize, config: &GenerationConfig) -> Self {
        let window = ContextWindow::for_prompt(n_ctx, config.n_keep, prompt.len());
        Self {
            prompt,
            n_consumed: 0,
            n_remain: (config.max_tokens > 0).then_some(config.max_tokens),
            pending: Vec::new(),
            history: TokenHistory::new(n_ctx),
            window,
        }
    }

    fn prompt_consumed(&self) -> bool {
        self.n_consumed >= self.prompt.len()
    }

    /// Queue up to `n_batch` further prompt tokens.
    fn queue_prompt(&mut self, n_batch: usize) {
        let end = (self.n_consumed + n_batch).min(self.prompt.len());
        self.pending
            .extend_from_slice(&self.prompt[self.n_consumed..end]);
        self.n_consumed = end;
    }
}

impl Session {
    /// Generate a completion for `prompt`, streaming pieces to `sink`.
    pub fn generate<S: TokenSink>(
        &mut self,
        config: &GenerationConfig,
        prompt: &str,
        sink: S,
    ) -> std::result::Result<Completion, GenerationError> {
        self.generate_with(config, prompt, sink, &GenerateOptions::default())
    }

    /// [`Session::generate`] with a cancellation token and telemetry hook.
    pub fn generate_with<S: TokenSink>(
        &mut self,
        config: &GenerationConfig,
        prompt: &str,
        mut sink: S,
        options: &GenerateOptions,
    ) -> std::result::Result<Completion, GenerationError> {
        let span = info_span!("generate", session = %self.id());
        let _guard = span.enter();

        let mut output = Output::default();
        match self.run(config, prompt, &mut sink, options, &mut output) {
            Ok((state, stats)) => {
                info!(
                    ?state,
                    prompt_tokens = stats.prompt_tokens,
                    generated = stats.generated_tokens,
                    window_shifts = stats.window_shifts,
                    tokens_per_sec = stats.tokens_per_sec,
                    "generation finished"
                );
                Ok(Completion {
                    text: output.text,
                    tokens: output.tokens,
                    state,
                    stop_sequence: output.stop_sequence,
                    stats,
                })
            }
            Err(source) => {
                warn!(error = %source, generated = output.tokens.len(), "generation failed");
                Err(GenerationError {
                    source,
                    partial_text: output.text,
                    partial_tokens: output.tokens,
                })
            }
        }
    }

    fn run<S: TokenSink>(
        &mut self,
        config: &GenerationConfig,
        prompt: &str,
        sink: &mut S,
        options: &GenerateOptions,
        output: &mut Output,
    ) -> Result<(TerminalState, InferenceMetrics)> {
        config.validate()?;

        let rt = self.runtime_mut();
        let n_ctx = match config.n_ctx {
            0 => rt.n_ctx(),
            n => n.min(rt.n_ctx()),
        };
        rt.set_n_threads(config.n_threads);

        let prompt_tokens = tokenize_prompt(&*rt, prompt, n_ctx)?;
        let vocab = VocabInfo::for_config(&*rt, config)?;
        let mut chain = SamplerChain::build(config, &vocab)?;

        debug!(
            prompt_tokens = prompt_tokens.len(),
            n_ctx,
            n_batch = config.n_batch,
            max_tokens = config.max_tokens,
            "prompt admitted"
        );

        let hook = options
            .telemetry
            .clone()
            .unwrap_or_else(|| Arc::new(NoopTelemetry));
        let mut timer = InferenceTimer::new(prompt_tokens.len(), hook);
        let mut work = GenerationState::new(prompt_tokens, n_ctx, config);

        let state = loop {
            if options.is_cancelled() {
                debug!(generated = output.tokens.len(), "generation cancelled");
                break TerminalState::Cancelled;
            }

            if !work.pending.is_empty() {
                if work.window.fit(&mut work.history, &mut work.pending)?.is_some() {
                    timer.mark_window_shift();
                }
                for batch in work.pending.chunks(config.n_batch) {
                    let n_past = work.history.len();
                    debug!(n_past, n_tokens = batch.len(), "decode batch");
                    if let Err(err) = rt.decode(batch, n_past) {
                        warn!(n_past, n_tokens = batch.len(), "decode failed");
                        return Err(err);
                    }
                    work.history.extend(batch)?;
                }
                work.pending.clear();
            }

            if !work.prompt_consumed() {
                work.queue_prompt(config.n_batch);
                continue;
            }

            timer.mark_prefill_complete();

            let logits = rt
                .logits()
                .ok_or_else(|| LlamaError::Decode("runtime produced no logits".into()))?;
            let id = chain.sample(logits)?;
            chain.accept(id)?;
            work.pending.push(id);

            let piece = rt.token_to_piece(id)?;
            output.text.push_str(&piece);
            output.tokens.push(id);
            timer.mark_token();
            if let Some(n) = work.n_remain.as_mut() {
                *n = n.saturating_sub(1);
            }

            if !sink.on_token(&piece, id) {
                debug!(generated = output.tokens.len(), "sink requested stop");
                break TerminalState::Cancelled;
            }
            if !config.ignore_eos && rt.is_eog(id) {
                break TerminalState::Stopped(StopReason::Eos);
            }
            if let Some(stop) = config
                .antiprompts
                .iter()
                .find(|a| !a.is_empty() && output.text.ends_with(a.as_str()))
            {
                output.stop_sequence = Some(stop.clone());
                break TerminalState::Stopped(StopReason::Antiprompt);
            }
            if work.n_remain == Some(0) {
                break TerminalState::Stopped(StopReason::MaxTokens);
            }
        };

        Ok((state, timer.finish()))
    }
}

/// Tokenize a prompt and check it against the context.
///
/// An empty prompt falls back to a lone BOS token.
fn tokenize_prompt<R: Runtime + ?Sized>(rt: &R, prompt: &str, n_ctx: usize) -> Result<Vec<TokenId>> {
    let mut tokens = rt.tokenize(prompt, rt.add_bos())?;
    if tokens.is_empty() {
        match rt.token_bos() {
            Some(bos) => tokens.push(bos),
            None => {
                return Err(LlamaError::Tokenize(
                    "empty prompt and the model has no BOS token".into(),
                ))
            }
        }
    }

    let limit = n_ctx.saturating_sub(PROMPT_HEADROOM);
    if tokens.len() > limit {
        return Err(LlamaError::Tokenize(format!(
            "prompt is {} tokens, context allows at most {limit}",
            tokens.len()
        )));
    }
    Ok(tokens)
}
