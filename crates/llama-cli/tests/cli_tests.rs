//! Integration tests for llama-cli.
//!
//! Validates:
//! - Flag parsing and flag-over-file precedence
//! - Generate output is streamed and reproducible with a fixed seed
//! - Interrupted generation still saves state
//! - Tokenize, embed and info output formats
//! - Error mapping for bad flags and missing files

use clap::Parser;
use llama_cli::*;
use llama_engine::LlamaError;
use tokio_util::sync::CancellationToken;

fn parse(args: &[&str]) -> Cli {
    let mut argv = vec!["llama-cli"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap()
}

fn run_to_string(args: &[&str], cancel: CancellationToken) -> (RunOutcome, String) {
    let mut out = Vec::new();
    let outcome = run(parse(args).command, cancel, &mut out).unwrap();
    (outcome, String::from_utf8(out).unwrap())
}

// ===========================================================================
// Parsing
// ===========================================================================

#[test]
fn generate_flags_override_defaults() {
    let cli = parse(&[
        "generate", "-p", "hi", "-n", "8", "-t", "0", "-r", "User:", "-r", "###", "-c", "64",
        "--logit-bias", "5+1.5",
    ]);
    let Command::Generate { model, sampling, .. } = cli.command else {
        panic!("expected generate");
    };

    let config = sampling.config().unwrap();
    assert_eq!(config.max_tokens, 8);
    assert_eq!(config.temperature, 0.0);
    assert_eq!(config.antiprompts, vec!["User:", "###"]);
    assert_eq!(config.logit_bias.len(), 1);
    assert_eq!(model.params().unwrap().n_ctx, 64);
}

#[test]
fn flags_win_over_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gen.json");
    std::fs::write(&path, r#"{"top_k": 5, "max_tokens": 3}"#).unwrap();

    let cli = parse(&[
        "generate",
        "-p",
        "hi",
        "--config",
        path.to_str().unwrap(),
        "-n",
        "7",
    ]);
    let Command::Generate { sampling, .. } = cli.command else {
        panic!("expected generate");
    };
    let config = sampling.config().unwrap();
    assert_eq!(config.top_k, 5);
    assert_eq!(config.max_tokens, 7);
}

#[test]
fn invalid_mirostat_is_config_error() {
    let sampling = SamplingArgs {
        mirostat: Some(3),
        ..Default::default()
    };
    assert!(matches!(
        sampling.config(),
        Err(CliError::Llama(LlamaError::Config(_)))
    ));
}

#[test]
fn bad_tensor_split_is_rejected() {
    let model = ModelArgs {
        tensor_split: Some("3,-1".into()),
        ..Default::default()
    };
    assert!(model.params().is_err());

    let model = ModelArgs {
        tensor_split: Some("3/1".into()),
        ..Default::default()
    };
    assert_eq!(model.params().unwrap().tensor_split, vec![3.0, 1.0]);
}

#[test]
fn verbose_is_global() {
    let cli = parse(&["info", "--verbose"]);
    assert!(cli.verbose);
}

// ===========================================================================
// Commands
// ===========================================================================

#[test]
fn generate_is_reproducible_with_seed() {
    let args = [
        "generate", "-p", "Once", "-n", "12", "-s", "7", "-c", "64", "--ignore-eos",
    ];
    let (outcome, first) = run_to_string(&args, CancellationToken::new());
    let (_, second) = run_to_string(&args, CancellationToken::new());

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(first, second);
    assert!(first.ends_with('\n'));
}

#[test]
fn interrupted_generate_still_saves_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (outcome, out) = run_to_string(
        &[
            "generate",
            "-p",
            "hi",
            "-c",
            "64",
            "--save-state",
            path.to_str().unwrap(),
        ],
        cancel,
    );
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(out, "\n");
    assert!(std::fs::metadata(&path).unwrap().len() > 0);
}

#[test]
fn load_state_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.bin");
    let cli = parse(&[
        "generate",
        "-p",
        "hi",
        "--load-state",
        missing.to_str().unwrap(),
    ]);
    let mut out = Vec::new();
    let err = run(cli.command, CancellationToken::new(), &mut out).unwrap_err();
    assert!(matches!(err, CliError::Llama(LlamaError::Io(_))));
}

#[test]
fn tokenize_prints_one_line_per_token() {
    let (_, out) = run_to_string(&["tokenize", "abc"], CancellationToken::new());
    let lines: Vec<&str> = out.lines().collect();
    // BOS + 3 characters
    assert_eq!(lines.len(), 4);
    assert!(lines[1].ends_with("\"a\""));
}

#[test]
fn embed_prints_json_vector() {
    let (_, out) = run_to_string(&["embed", "hello"], CancellationToken::new());
    let values: Vec<f32> = serde_json::from_str(out.trim()).unwrap();
    assert_eq!(values.len(), 16);
}

#[test]
fn info_prints_model_metadata() {
    let (_, out) = run_to_string(&["info"], CancellationToken::new());
    let info: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(info["vocab_size"], 98);
    assert_eq!(info["layer_count"], 1);
}
