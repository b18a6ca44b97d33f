//! # llama-cli
//!
//! Command-line front end over [`TinyRuntime`].
//!
//! Commands:
//! - `generate`: stream a completion to stdout, optionally loading or saving
//!   session state around the call
//! - `tokenize`: print token ids and pieces
//! - `embed`: print the embedding vector as JSON
//! - `info`: print model metadata as JSON
//!
//! Config files are JSON ([`GenerationConfig`] / [`ModelParams`]); flags
//! override file values.

use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use llama_engine::{parse_logit_bias, GenerationConfig, LlamaError, ModelParams};
use llama_runtime::{GenerateOptions, GenerationError, Session, TinyRuntime};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors surfaced to the command line.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Llama(#[from] LlamaError),
    #[error("generation failed after {} tokens: {}", .0.partial_tokens.len(), .0.source)]
    Generation(#[from] GenerationError),
    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a command ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// llama-cli: streaming generation over a tiny reference runtime
#[derive(Debug, Parser)]
#[command(name = "llama-cli", version)]
pub struct Cli {
    /// Log debug output to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a completion for a prompt.
    Generate {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// Restore session state from this file before generating.
        #[arg(long)]
        load_state: Option<PathBuf>,

        /// Save session state to this file afterwards, also when interrupted.
        #[arg(long)]
        save_state: Option<PathBuf>,

        /// Print only the trimmed completion once generation ends.
        #[arg(long)]
        trim: bool,
    },
    /// Print the tokens of a text.
    Tokenize {
        text: String,

        #[command(flatten)]
        model: ModelArgs,
    },
    /// Print the embedding of a text.
    Embed {
        text: String,

        #[command(flatten)]
        model: ModelArgs,
    },
    /// Print model metadata.
    Info {
        #[command(flatten)]
        model: ModelArgs,
    },
}

/// Load-time flags.
#[derive(Debug, Clone, Default, Args)]
pub struct ModelArgs {
    /// JSON file with model parameters.
    #[arg(long)]
    pub model_config: Option<PathBuf>,

    /// Context size in tokens.
    #[arg(short = 'c', long)]
    pub ctx_size: Option<usize>,

    /// Seed for the runtime's weights.
    #[arg(long)]
    pub model_seed: Option<u64>,

    /// Number of layers to offload to the GPU.
    #[arg(long)]
    pub gpu_layers: Option<i32>,

    /// Per-device split ratios, e.g. "3,1" or "3/1".
    #[arg(long)]
    pub tensor_split: Option<String>,
}

impl ModelArgs {
    pub fn params(&self) -> Result<ModelParams, CliError> {
        let mut params = match &self.model_config {
            Some(path) => ModelParams::from_json_file(path)?,
            None => ModelParams::default(),
        };
        if let Some(n) = self.ctx_size {
            params.n_ctx = n;
        }
        if let Some(seed) = self.model_seed {
            params.seed = seed;
        }
        if let Some(n) = self.gpu_layers {
            params.n_gpu_layers = n;
        }
        if let Some(split) = &self.tensor_split {
            params = params.with_tensor_split(split)?;
        }
        Ok(params)
    }
}

/// Per-request flags.
#[derive(Debug, Clone, Default, Args)]
pub struct SamplingArgs {
    /// JSON file with generation settings.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Maximum tokens to generate (0 = until a stop condition).
    #[arg(short = 'n', long)]
    pub max_tokens: Option<usize>,

    /// Sampling temperature; 0 selects greedy decoding.
    #[arg(short, long)]
    pub temperature: Option<f32>,

    #[arg(long)]
    pub top_k: Option<i32>,

    #[arg(long)]
    pub top_p: Option<f32>,

    #[arg(long)]
    pub min_p: Option<f32>,

    #[arg(long)]
    pub repeat_penalty: Option<f32>,

    #[arg(long)]
    pub repeat_last_n: Option<i32>,

    /// Mirostat mode: 0 off, 1 or 2.
    #[arg(long)]
    pub mirostat: Option<i32>,

    /// Sampling seed; random when unset.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Prompt tokens decoded per batch.
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    /// Prompt tokens kept when the context window shifts.
    #[arg(long)]
    pub keep: Option<usize>,

    #[arg(long)]
    pub threads: Option<usize>,

    /// Stop when the output ends with this text. Repeatable.
    #[arg(short = 'r', long = "antiprompt")]
    pub antiprompts: Vec<String>,

    #[arg(long)]
    pub ignore_eos: bool,

    /// GBNF grammar file constraining the output.
    #[arg(long)]
    pub grammar_file: Option<PathBuf>,

    /// Token biases, e.g. "15043+1,30-inf".
    #[arg(long)]
    pub logit_bias: Option<String>,
}

impl SamplingArgs {
    pub fn config(&self) -> Result<GenerationConfig, CliError> {
        let mut config = match &self.config {
            Some(path) => GenerationConfig::from_json_file(path)?,
            None => GenerationConfig::default(),
        };
        if let Some(n) = self.max_tokens {
            config.max_tokens = n;
        }
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(k) = self.top_k {
            config.top_k = k;
        }
        if let Some(p) = self.top_p {
            config.top_p = p;
        }
        if let Some(p) = self.min_p {
            config.min_p = p;
        }
        if let Some(p) = self.repeat_penalty {
            config.repeat_penalty = p;
        }
        if let Some(n) = self.repeat_last_n {
            config.repeat_last_n = n;
        }
        if let Some(mode) = self.mirostat {
            config.mirostat = mode;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(n) = self.batch_size {
            config.n_batch = n;
        }
        if let Some(n) = self.keep {
            config.n_keep = n;
        }
        if let Some(n) = self.threads {
            config.n_threads = n;
        }
        config.antiprompts.extend(self.antiprompts.iter().cloned());
        if self.ignore_eos {
            config.ignore_eos = true;
        }
        if let Some(path) = &self.grammar_file {
            let grammar = std::fs::read_to_string(path).map_err(LlamaError::from)?;
            config.grammar = Some(grammar);
        }
        if let Some(biases) = &self.logit_bias {
            config.logit_bias.extend(parse_logit_bias(biases)?);
        }
        config.validate()?;
        Ok(config)
    }
}

fn open_session(params: &ModelParams) -> Result<Session, CliError> {
    Ok(Session::new(TinyRuntime::load(params)?))
}

/// Execute one command, writing its output to `out`.
pub fn run(
    command: Command,
    cancel: CancellationToken,
    out: &mut impl Write,
) -> Result<RunOutcome, CliError> {
    match command {
        Command::Generate {
            prompt,
            model,
            sampling,
            load_state,
            save_state,
            trim,
        } => {
            let params = model.params()?;
            let config = sampling.config()?;
            let mut session = open_session(&params)?;
            if let Some(path) = &load_state {
                session.load_state(path)?;
            }

            let options = GenerateOptions::new().with_cancel(cancel);
            let mut write_error = None;
            let completion = session.generate_with(
                &config,
                &prompt,
                |piece: &str| {
                    if trim {
                        return true;
                    }
                    match out.write_all(piece.as_bytes()).and_then(|()| out.flush()) {
                        Ok(()) => true,
                        Err(e) => {
                            write_error = Some(e);
                            false
                        }
                    }
                },
                &options,
            )?;
            if let Some(e) = write_error {
                return Err(e.into());
            }

            if trim {
                write!(out, "{}", completion.trimmed())?;
            }
            writeln!(out)?;

            if let Some(path) = &save_state {
                let bytes = session.save_state(path)?;
                info!(path = %path.display(), bytes, "session state written");
            }

            info!(
                state = ?completion.state,
                tokens = completion.tokens.len(),
                ttft_ms = completion.stats.ttft_ms,
                tokens_per_sec = completion.stats.tokens_per_sec,
                "done"
            );
            Ok(if completion.state.is_cancelled() {
                RunOutcome::Cancelled
            } else {
                RunOutcome::Completed
            })
        }
        Command::Tokenize { text, model } => {
            let session = open_session(&model.params()?)?;
            for token in session.tokenize(&text)? {
                let piece = session.runtime().token_to_piece(token)?;
                writeln!(out, "{token:>6} {piece:?}")?;
            }
            Ok(RunOutcome::Completed)
        }
        Command::Embed { text, model } => {
            let params = model.params()?.with_embeddings(true);
            let mut session = open_session(&params)?;
            let embedding = session.embed(text.as_str())?;
            writeln!(out, "{}", serde_json::to_string(&embedding)?)?;
            Ok(RunOutcome::Completed)
        }
        Command::Info { model } => {
            let session = open_session(&model.params()?)?;
            writeln!(out, "{}", serde_json::to_string_pretty(&session.model_info())?)?;
            Ok(RunOutcome::Completed)
        }
    }
}
