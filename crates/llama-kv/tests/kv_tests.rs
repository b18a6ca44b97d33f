//! Integration tests for llama-kv.
//!
//! Validates:
//! - Overflow policy: post-shift n_past == max(1, n_keep) and the retained
//!   prefix is untouched, for a grid of context sizes and keep lengths
//! - History never exceeds capacity after any windowing pass
//! - Repeated shifts during a long simulated generation
//! - Re-fed tokens come from the region right after the retained prefix
//! - Error paths when no amount of shifting can make room

use llama_engine::TokenId;
use llama_kv::*;

fn filled(n: usize, capacity: usize) -> TokenHistory {
    let mut h = TokenHistory::new(capacity);
    let tokens: Vec<TokenId> = (0..n as TokenId).collect();
    h.extend(&tokens).unwrap();
    h
}

// ===========================================================================
// Policy properties
// ===========================================================================

#[test]
fn post_shift_n_past_is_max_one_keep() {
    for n_ctx in [4usize, 8, 16, 33] {
        for keep in 0..n_ctx - 1 {
            let window = ContextWindow::new(n_ctx, keep);
            let mut h = filled(n_ctx, n_ctx);
            let mut pending = vec![-1];

            let shift = window
                .fit(&mut h, &mut pending)
                .unwrap()
                .expect("full context must shift");

            assert_eq!(shift.n_past_after, keep.max(1), "n_ctx={n_ctx} keep={keep}");
            assert_eq!(h.len(), keep.max(1));
            let prefix: Vec<TokenId> = (0..keep as TokenId).collect();
            assert_eq!(&h.tokens()[..keep], prefix.as_slice());
            assert!(h.len() + pending.len() <= n_ctx);
            assert_eq!(pending.last(), Some(&-1));
        }
    }
}

#[test]
fn refed_tokens_follow_retained_prefix() {
    let window = ContextWindow::new(20, 4);
    let mut h = filled(20, 20);
    let mut pending = vec![-1];
    window.fit(&mut h, &mut pending).unwrap();

    // n_left = 16, so [4, 12) is re-fed ahead of the pending token
    let expected: Vec<TokenId> = (4..12).chain([-1]).collect();
    assert_eq!(pending, expected);
}

#[test]
fn shift_accounting_adds_up() {
    let window = ContextWindow::new(32, 5);
    let mut h = filled(31, 32);
    let mut pending = vec![-1, -2];
    let shift = window.fit(&mut h, &mut pending).unwrap().unwrap();
    assert_eq!(
        shift.n_past_after + shift.n_refed + shift.n_discarded,
        shift.n_past_before
    );
}

// ===========================================================================
// Simulated generation
// ===========================================================================

#[test]
fn long_generation_stays_within_capacity() {
    let n_ctx = 16;
    let prompt: Vec<TokenId> = vec![1000, 1001, 1002];
    let window = ContextWindow::for_prompt(n_ctx, 64, prompt.len());
    assert_eq!(window.n_keep(), 3);

    let mut h = TokenHistory::new(n_ctx);
    h.extend(&prompt).unwrap();

    let mut shifts = 0;
    for step in 0..200 {
        let mut pending = vec![step as TokenId];
        if window.fit(&mut h, &mut pending).unwrap().is_some() {
            shifts += 1;
        }
        h.extend(&pending).unwrap();
        assert!(h.len() <= n_ctx);
        assert_eq!(&h.tokens()[..3], prompt.as_slice());
    }
    assert!(shifts > 0);
}

// ===========================================================================
// Error paths
// ===========================================================================

#[test]
fn keep_equal_to_context_cannot_make_room() {
    let window = ContextWindow::new(8, 8);
    let mut h = filled(8, 8);
    let mut pending = vec![-1];
    assert_eq!(
        window.fit(&mut h, &mut pending),
        Err(KVError::CapacityExceeded { seq_len: 9, max: 8 })
    );
}

#[test]
fn capacity_error_converts_to_decode_error() {
    let err: llama_engine::LlamaError = KVError::CapacityExceeded { seq_len: 9, max: 8 }.into();
    assert!(matches!(err, llama_engine::LlamaError::Decode(_)));
}
