//! Tests for session state persistence.

use llama_gen::*;

fn config() -> GenerationConfig {
    GenerationConfig::new()
        .with_seed(21)
        .with_max_tokens(16)
        .with_ignore_eos(true)
}

#[test]
fn test_state_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");

    let mut session = Session::new(TinyRuntime::new(64, 4).unwrap());
    session.generate(&config(), "remember", |_: &str| true).unwrap();
    let written = session.save_state(&path).unwrap();
    assert_eq!(written, session.runtime().state_size());

    let mut restored = Session::new(TinyRuntime::new(64, 4).unwrap());
    assert_eq!(restored.load_state(&path).unwrap(), written);
    assert_eq!(restored.snapshot().unwrap(), session.snapshot().unwrap());
}

#[test]
fn test_restore_reproduces_generation() {
    let mut session = Session::new(TinyRuntime::new(64, 4).unwrap());
    session.generate(&config(), "context", |_: &str| true).unwrap();
    let snap = session.snapshot().unwrap();

    let first = session.generate(&config(), "next", |_: &str| true).unwrap();
    session.restore(&snap).unwrap();
    let second = session.generate(&config(), "next", |_: &str| true).unwrap();
    assert_eq!(first.text, second.text);
}

#[test]
fn test_truncated_file_leaves_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.bin");

    let mut session = Session::new(TinyRuntime::new(64, 4).unwrap());
    session.generate(&config(), "before", |_: &str| true).unwrap();
    let full = session.snapshot().unwrap();
    std::fs::write(&path, &full[..full.len() / 2]).unwrap();

    let err = session.load_state(&path).unwrap_err();
    assert!(matches!(err, LlamaError::State(_)));
    assert_eq!(session.snapshot().unwrap(), full);
}

#[test]
fn test_snapshot_from_other_context_size_is_rejected() {
    let small = Session::new(TinyRuntime::new(32, 4).unwrap());
    let mut large = Session::new(TinyRuntime::new(64, 4).unwrap());
    let err = large.restore(&small.snapshot().unwrap()).unwrap_err();
    assert!(matches!(err, LlamaError::State(_)));
}

#[test]
fn test_save_overwrites_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.bin");
    std::fs::write(&path, b"stale contents that are much longer than nothing").unwrap();

    let session = Session::new(TinyRuntime::new(16, 4).unwrap());
    let written = session.save_state(&path).unwrap();
    assert_eq!(std::fs::read(&path).unwrap().len(), written);
}
