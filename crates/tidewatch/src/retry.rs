use crate::errors::FetchError;
use std::{future::Future, time::Duration};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Total attempts, including the first one.
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Disable the `uniform(0.5, 1.0)` multiplier (deterministic delays).
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// No waiting between attempts. Handy for tests and for callers that rotate endpoints.
    pub const fn immediate(attempts: usize) -> Self {
        Self {
            attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }
}

/// Delay before attempt `attempt` (1-indexed). Attempt 1 never waits; attempt `i > 1` waits
/// `base * 2^(i-2) * uniform(0.5, 1.0)`, capped at `max_delay`.
pub fn compute_backoff_delay(cfg: &BackoffConfig, attempt: usize) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let shift = u32::try_from((attempt - 2).min(16)).unwrap_or(16_u32);
    let pow2 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(cfg.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(cfg.max_delay.as_millis()).unwrap_or(u64::MAX);
    let ms = base_ms.saturating_mul(pow2).min(max_ms);

    let permille = if cfg.jitter {
        // Avoid holding a non-Send RNG across await points.
        jitter_permille(rand::random::<u64>())
    } else {
        1000_u64
    };
    Duration::from_millis(ms.saturating_mul(permille) / 1000)
}

/// Map a random draw onto the `uniform(0.5, 1.0)` multiplier, in thousandths: `500..=1000`.
fn jitter_permille(draw: u64) -> u64 {
    500_u64.saturating_add(draw % 501)
}

/// Run `op` up to `cfg.attempts` times, sleeping with exponential backoff + jitter between
/// attempts. Permanent errors (see [`FetchError::is_retryable`]) are returned immediately; the
/// last error is returned once attempts are exhausted.
pub async fn retry_with_backoff<T, Fut>(
    cfg: &BackoffConfig,
    mut op: impl FnMut(usize) -> Fut + Send,
    context_label: &str,
) -> Result<T, FetchError>
where
    Fut: Future<Output = Result<T, FetchError>> + Send,
{
    if cfg.attempts == 0 {
        return Err(FetchError::ConfigurationMissing(
            "invalid backoff config: attempts=0".to_owned(),
        ));
    }

    let mut last_err: Option<FetchError> = None;
    for attempt in 1..=cfg.attempts {
        let d = compute_backoff_delay(cfg, attempt);
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                debug!(op = context_label, attempt, error = %e, "upstream attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| FetchError::Transport(format!("{context_label}: unknown error"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn delay_doubles_per_attempt_and_is_capped() {
        let cfg = BackoffConfig {
            attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(compute_backoff_delay(&cfg, 1), Duration::ZERO);
        assert_eq!(compute_backoff_delay(&cfg, 2), Duration::from_millis(100));
        assert_eq!(compute_backoff_delay(&cfg, 3), Duration::from_millis(200));
        assert_eq!(compute_backoff_delay(&cfg, 4), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_between_half_and_full_delay() {
        assert_eq!(jitter_permille(0), 500_u64);
        assert_eq!(jitter_permille(500), 1000_u64);
        assert_eq!(jitter_permille(501), 500_u64);
        assert!((500..=1000).contains(&jitter_permille(u64::MAX)));

        let cfg = BackoffConfig {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0_u8..50 {
            let d = compute_backoff_delay(&cfg, 2);
            assert!(
                d >= Duration::from_millis(50) && d <= Duration::from_millis(100),
                "jittered delay out of range: {d:?}"
            );
        }
    }

    #[tokio::test]
    async fn retries_until_attempts_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let res: Result<(), FetchError> = retry_with_backoff(
            &BackoffConfig::immediate(3),
            move |_| {
                let c = Arc::clone(&calls2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Transport("down".into()))
                }
            },
            "op",
        )
        .await;
        assert!(matches!(res, Err(FetchError::Transport(_))), "got {res:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3_usize);
    }

    #[tokio::test]
    async fn returns_first_success() -> eyre::Result<()> {
        let out = retry_with_backoff(
            &BackoffConfig::immediate(3),
            |attempt| async move {
                if attempt == 2 {
                    Ok(42_i32)
                } else {
                    Err(FetchError::RateLimited("slow down".into()))
                }
            },
            "op",
        )
        .await?;
        assert_eq!(out, 42_i32);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_errors_short_circuit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let res: Result<(), FetchError> = retry_with_backoff(
            &BackoffConfig::immediate(3),
            move |_| {
                let c = Arc::clone(&calls2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Decode("garbage".into()))
                }
            },
            "op",
        )
        .await;
        assert!(matches!(res, Err(FetchError::Decode(_))), "got {res:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1_usize);
    }
}
