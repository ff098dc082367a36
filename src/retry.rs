//! Generic retry engine: exponential backoff with jitter and
//! error-class-aware retry decisions.
//!
//! Any fallible async operation (subprocess invocation, tracking-service
//! call) can be wrapped with [`with_retry`]. The policy decides how many
//! attempts to make and how long to sleep between them; [`is_retryable`]
//! decides whether a given failure is worth another attempt at all.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::NON_RETRYABLE_CODES;
use crate::{AppError, Result};

/// Jitter spread applied around the computed delay: ±25 %.
const JITTER_SPREAD: f64 = 0.25;

/// Progress callback invoked before each backoff sleep with
/// `(attempt_number, delay, error)`.
pub type RetryCallback = Arc<dyn Fn(u32, Duration, &AppError) + Send + Sync>;

/// Immutable retry configuration for one wrapped operation.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first; total attempts are
    /// `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the computed delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failing attempt.
    pub backoff_multiplier: f64,
    /// Error codes eligible for retry (see [`AppError::code`]).
    pub retryable_codes: HashSet<String>,
    /// Whether to randomize each delay within ±25 %.
    pub jitter: bool,
    /// Optional observer invoked before each backoff sleep.
    pub on_retry: Option<RetryCallback>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("retryable_codes", &self.retryable_codes)
            .field("jitter", &self.jitter)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// General-purpose preset: 3 retries, 1 s → 30 s backoff.
    #[must_use]
    pub fn standard() -> Self {
        Self::with_knobs(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Preset for rate-limited endpoints (HTTP 429): 5 retries, 5 s → 60 s.
    #[must_use]
    pub fn rate_limit() -> Self {
        Self::with_knobs(5, Duration::from_secs(5), Duration::from_secs(60))
    }

    /// Preset for idempotent reads: 5 retries, 500 ms → 15 s.
    #[must_use]
    pub fn read_heavy() -> Self {
        Self::with_knobs(5, Duration::from_millis(500), Duration::from_secs(15))
    }

    fn with_knobs(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            retryable_codes: default_retryable_codes(),
            jitter: true,
            on_retry: None,
        }
    }

    /// Disable jitter (deterministic delays, mainly for tests).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Attach a progress callback.
    #[must_use]
    pub fn with_callback(mut self, callback: RetryCallback) -> Self {
        self.on_retry = Some(callback);
        self
    }
}

/// Codes the named presets treat as transient.
fn default_retryable_codes() -> HashSet<String> {
    [
        "NETWORK_ERROR",
        "AGENT_TIMEOUT",
        "AGENT_STALLED",
        "AGENT_PROCESS_ERROR",
        "TRACKER_API_ERROR",
        "IO_ERROR",
    ]
    .iter()
    .map(|code| (*code).to_owned())
    .collect()
}

/// Result of [`with_retry_detailed`]: the value plus attempt telemetry.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Value produced by the successful attempt.
    pub value: T,
    /// Total attempts performed (1-based).
    pub attempts: u32,
    /// Wall-clock time spent across attempts and backoff sleeps.
    pub elapsed: Duration,
}

/// Decide whether `error` warrants another attempt under `retryable_codes`.
///
/// - Auth failures are never retryable.
/// - Network failures carry their own retryable flag.
/// - Tracking-service API errors are retryable only for 5xx and 429.
/// - Everything else is retryable iff its code is in `retryable_codes`
///   and not in [`NON_RETRYABLE_CODES`]; the non-retryable set wins.
#[must_use]
pub fn is_retryable(error: &AppError, retryable_codes: &HashSet<String>) -> bool {
    match error {
        AppError::Auth(_) => false,
        AppError::Network { retryable, .. } => *retryable,
        AppError::Tracker { status, .. } => *status == 429 || (500..=599).contains(status),
        other => {
            let code = other.code();
            !NON_RETRYABLE_CODES.contains(&code) && retryable_codes.contains(code)
        }
    }
}

/// Delay before the retry that follows failing attempt `attempt` (1-based):
/// `min(initial * multiplier^(attempt - 1), max)`, without jitter.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let raw = policy.initial_delay.as_millis() as f64 * policy.backoff_multiplier.powi(exponent);
    let capped = raw.min(policy.max_delay.as_millis() as f64);
    Duration::from_millis(capped.round().max(0.0) as u64)
}

/// Randomize `delay` within ±25 %.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn apply_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(1.0 - JITTER_SPREAD..=1.0 + JITTER_SPREAD);
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

/// Run `operation` with retries per `policy`, returning only the value.
///
/// # Errors
///
/// Returns the first non-retryable error immediately, or the last error
/// once `max_retries + 1` attempts are exhausted.
pub async fn with_retry<T, F, Fut>(operation: F, policy: &RetryPolicy) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    with_retry_detailed(operation, policy)
        .await
        .map(|outcome| outcome.value)
}

/// Like [`with_retry`], additionally reporting attempt count and elapsed
/// wall-clock time.
///
/// # Errors
///
/// Same semantics as [`with_retry`].
pub async fn with_retry_detailed<T, F, Fut>(
    mut operation: F,
    policy: &RetryPolicy,
) -> Result<RetryOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }
            Err(err) => {
                if !is_retryable(&err, &policy.retryable_codes) {
                    debug!(code = err.code(), "error is not retryable");
                    return Err(err);
                }
                if attempt > policy.max_retries {
                    warn!(
                        attempts = attempt,
                        code = err.code(),
                        "retries exhausted"
                    );
                    return Err(err);
                }

                let mut delay = backoff_delay(policy, attempt);
                if policy.jitter {
                    delay = apply_jitter(delay);
                }
                if let Some(callback) = &policy.on_retry {
                    callback(attempt, delay, &err);
                }
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    code = err.code(),
                    "retrying after backoff"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
