//! Per-call timing for [`Session::generate_with`](crate::Session::generate_with).
//!
//! The decode loop drives an [`InferenceTimer`]; callers observe it through a
//! [`TelemetryHook`] passed in [`GenerateOptions`](crate::GenerateOptions).

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Timing and volume of one generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceMetrics {
    /// Milliseconds until the first token could be sampled.
    pub ttft_ms: f64,
    /// Sampling rate after the prompt was consumed.
    pub tokens_per_sec: f64,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub window_shifts: usize,
    pub total_time_ms: f64,
}

/// Observer for a generation call. Override only the events you need.
pub trait TelemetryHook: Send + Sync {
    /// The prompt is in the context and sampling starts.
    fn on_prefill_complete(&self, _ttft_ms: f64) {}

    /// `token_idx` counts from 1.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Fired once, including for cancelled calls. Failed calls never reach it.
    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Logs each finished call at debug level and keeps the most recent metrics.
/// Clones share the stored report.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last: Arc<Mutex<Option<InferenceMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.last.lock().ok().and_then(|slot| slot.clone())
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        tracing::debug!(
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            generated = metrics.generated_tokens,
            window_shifts = metrics.window_shifts,
            "generation metrics"
        );
        if let Ok(mut slot) = self.last.lock() {
            *slot = Some(metrics.clone());
        }
    }
}

fn ms_between(from: Instant, to: Instant) -> f64 {
    to.duration_since(from).as_secs_f64() * 1000.0
}

/// Clock for one call, started when the prompt is admitted.
pub struct InferenceTimer {
    hook: Arc<dyn TelemetryHook>,
    start: Instant,
    first_sample: Option<Instant>,
    prompt_tokens: usize,
    generated: usize,
    window_shifts: usize,
}

impl InferenceTimer {
    pub fn new(prompt_tokens: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            hook,
            start: Instant::now(),
            first_sample: None,
            prompt_tokens,
            generated: 0,
            window_shifts: 0,
        }
    }

    /// Idempotent: the loop calls this before every sample.
    pub fn mark_prefill_complete(&mut self) {
        if self.first_sample.is_none() {
            let now = Instant::now();
            self.first_sample = Some(now);
            self.hook.on_prefill_complete(ms_between(self.start, now));
        }
    }

    pub fn mark_token(&mut self) {
        self.generated += 1;
        let elapsed = ms_between(self.start, Instant::now());
        self.hook.on_token_generated(self.generated, elapsed);
    }

    pub fn mark_window_shift(&mut self) {
        self.window_shifts += 1;
    }

    pub fn finish(self) -> InferenceMetrics {
        let end = Instant::now();
        let total_time_ms = ms_between(self.start, end);
        let ttft_ms = self
            .first_sample
            .map_or(0.0, |t| ms_between(self.start, t));
        let sampling_secs = (total_time_ms - ttft_ms) / 1000.0;
        let tokens_per_sec = if self.generated > 0 && sampling_secs > 0.0 {
            self.generated as f64 / sampling_secs
        } else {
            0.0
        };

        let metrics = InferenceMetrics {
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.generated,
            window_shifts: self.window_shifts,
            total_time_ms,
        };
        self.hook.on_generation_complete(&metrics);
        metrics
    }
}
