/*!
 * Structured Tracing
 * Subscriber setup and spans for the places where callers block
 *
 * Features:
 * - Env-filtered, optionally JSON-formatted output
 * - Wait spans recording how long a caller blocked on a limiter
 * - Slow-wait warnings with structured fields
 */

use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Waits longer than this are reported at warn level
const SLOW_WAIT: Duration = Duration::from_millis(100);

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - LOADGUARD_TRACE_JSON: Enable JSON output (default: false)
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("LOADGUARD_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_line_number(true)
                    .with_file(true)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "structured tracing initialized");
    }
}

/// Span covering a blocking wait on a limiter
///
/// Records the wait duration on drop and flags slow waits.
pub struct WaitSpan {
    span: tracing::Span,
    start: Instant,
    limiter: String,
    kind: &'static str,
}

impl WaitSpan {
    pub fn new(limiter: &str, kind: &'static str) -> Self {
        let span = span!(
            Level::DEBUG,
            "wait",
            limiter = limiter,
            kind = kind,
            waited_us = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            limiter: limiter.to_string(),
            kind,
        }
    }

    /// Time spent waiting so far
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record how the wait ended ("admitted", "busy", "interrupted", ...)
    pub fn record_outcome(&self, outcome: &'static str) {
        self.span.record("outcome", outcome);
    }
}

impl Drop for WaitSpan {
    fn drop(&mut self) {
        let waited = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("waited_us", waited.as_micros() as u64);

        if waited > SLOW_WAIT {
            warn!(
                limiter = %self.limiter,
                kind = self.kind,
                waited_ms = waited.as_millis() as u64,
                slow = true,
                "slow wait detected"
            );
        } else {
            debug!(
                limiter = %self.limiter,
                kind = self.kind,
                waited_us = waited.as_micros() as u64,
                "wait completed"
            );
        }
    }
}

/// Helper to create a wait span
#[inline]
pub fn span_wait(limiter: &str, kind: &'static str) -> WaitSpan {
    WaitSpan::new(limiter, kind)
}
