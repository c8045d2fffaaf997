use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Calculate exponential backoff delay with jitter.
///
/// `attempt` is 0-indexed: the first retry uses `attempt = 0`.
///
/// Formula: `capped = min(base * 2^attempt, max)`, then
/// `round(capped + capped * jitter * rand[0, 1))`. The result never exceeds
/// `max * (1 + jitter)`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let sample: f64 = rand::rng().random();
    backoff_with_sample(attempt, config, sample)
}

/// Deterministic core of [`calculate_backoff`]; `sample` is the random draw in `[0, 1)`.
pub(crate) fn backoff_with_sample(attempt: u32, config: &RetryConfig, sample: f64) -> Duration {
    let exp_factor = 2u64.saturating_pow(attempt);
    let exponential = config.base_delay_ms.saturating_mul(exp_factor);
    let capped = exponential.min(config.max_delay_ms);

    let jitter = config.effective_jitter();
    let sample = if sample.is_finite() {
        sample.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let jittered = (capped as f64 + capped as f64 * jitter * sample).round();
    let ceiling = (config.max_delay_ms as f64 * (1.0 + jitter)).floor();

    // f64 -> u64 casts saturate, so the ceiling also keeps huge caps in range.
    Duration::from_millis(jittered.min(ceiling) as u64)
}
