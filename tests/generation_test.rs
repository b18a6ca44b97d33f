//! End-to-end tests for generation through the facade crate.

use llama_gen::*;

fn session(n_ctx: usize) -> Session {
    Session::new(TinyRuntime::new(n_ctx, 11).unwrap())
}

fn collect(session: &mut Session, config: &GenerationConfig, prompt: &str) -> (Completion, Vec<String>) {
    let mut pieces = Vec::new();
    let completion = session
        .generate(config, prompt, |piece: &str| {
            pieces.push(piece.to_string());
            true
        })
        .unwrap();
    (completion, pieces)
}

#[test]
fn test_greedy_is_deterministic() {
    let config = GenerationConfig::greedy().with_max_tokens(20);
    let (a, _) = collect(&mut session(128), &config, "The quick brown fox");
    let (b, _) = collect(&mut session(128), &config, "The quick brown fox");
    assert_eq!(a.tokens, b.tokens);
    assert_eq!(a.text, b.text);
}

#[test]
fn test_streamed_pieces_match_text() {
    let config = GenerationConfig::new().with_seed(1).with_max_tokens(16);
    let (completion, pieces) = collect(&mut session(128), &config, "stream");
    assert_eq!(pieces.concat(), completion.text);
    assert_eq!(pieces.len(), completion.tokens.len());
}

#[test]
fn test_mirostat_modes_generate() {
    for mode in [1, 2] {
        let config = GenerationConfig::new()
            .with_mirostat(mode, 5.0, 0.1)
            .with_seed(3)
            .with_max_tokens(10)
            .with_ignore_eos(true);
        let (completion, _) = collect(&mut session(128), &config, "mirostat");
        assert_eq!(completion.tokens.len(), 10, "mode {mode}");
    }
}

#[test]
fn test_grammar_output_always_matches() {
    let grammar = r#"
        root  ::= digit digit? digit? "!"
        digit ::= [0-9]
    "#;
    for seed in 0..5 {
        let config = GenerationConfig::new()
            .with_seed(seed)
            .with_max_tokens(0)
            .with_grammar(grammar);
        let (completion, _) = collect(&mut session(128), &config, "count:");
        let text = completion.text.as_str();
        assert!(text.ends_with('!'), "seed {seed}: {text:?}");
        let digits = &text[..text.len() - 1];
        assert!((1..=3).contains(&digits.len()));
        assert!(digits.chars().all(|c| c.is_ascii_digit()), "seed {seed}: {text:?}");
        assert_eq!(completion.state, TerminalState::Stopped(StopReason::Eos));
    }
}

#[test]
fn test_small_context_runs_past_capacity() {
    let config = GenerationConfig::new()
        .with_seed(5)
        .with_max_tokens(200)
        .with_ignore_eos(true)
        .with_n_keep(8);
    let (completion, _) = collect(&mut session(32), &config, "keep this prefix");
    assert_eq!(completion.tokens.len(), 200);
    assert!(completion.stats.window_shifts >= 1);
}

#[test]
fn test_cancellation_keeps_partial_output() {
    let cancel = tokio_util::sync::CancellationToken::new();
    let options = GenerateOptions::new().with_cancel(cancel.clone());
    let config = GenerationConfig::new().with_seed(9).with_max_tokens(0).with_ignore_eos(true);

    let mut session = session(128);
    let mut delivered = 0;
    let completion = session
        .generate_with(
            &config,
            "interrupt me",
            |_: &str| {
                delivered += 1;
                if delivered == 5 {
                    cancel.cancel();
                }
                true
            },
            &options,
        )
        .unwrap();
    assert_eq!(completion.state, TerminalState::Cancelled);
    assert_eq!(completion.tokens.len(), 5);
}

#[test]
fn test_version_is_set() {
    assert!(!VERSION.is_empty());
}
