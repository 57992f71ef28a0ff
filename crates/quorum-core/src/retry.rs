//! Retry policy and rate-limit classification.
//!
//! Everything here is pure: classification looks only at an error's string
//! form, and delay math takes its randomness as an argument. The async
//! execution of a retried call lives in `quorum-llm`.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_EXPONENTIAL_BASE: f64 = 2.0;

/// Upper bound of the random jitter, as a fraction of the computed delay.
pub const MAX_JITTER_FRACTION: f64 = 0.25;

/// Backoff parameters for calls to a rate-limited dependency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "crate::duration")]
    pub initial_delay: Duration,
    #[serde(with = "crate::duration")]
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            exponential_base: DEFAULT_EXPONENTIAL_BASE,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), before jitter.
    ///
    /// A server-suggested interval replaces the exponential term but is still
    /// capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        let raw = match suggested {
            Some(d) => d.as_secs_f64(),
            None => {
                let exp = self.exponential_base.powi(attempt.min(63) as i32);
                self.initial_delay.as_secs_f64() * exp
            }
        };
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Full delay including jitter. `random` must be in `[0.0, 1.0)`.
    pub fn delay(&self, attempt: u32, suggested: Option<Duration>, random: f64) -> Duration {
        let base = self.base_delay(attempt, suggested);
        if !self.jitter {
            return base;
        }
        let fraction = random.clamp(0.0, 1.0) * MAX_JITTER_FRACTION;
        base + base.mul_f64(fraction)
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "throttl",
    "quota exceeded",
    "quota_exceeded",
];

/// Whether an error message describes a rate-limit class failure.
pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

static RETRY_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:retry[ -]after|try again in|wait)\s*:?\s*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|seconds?|secs?|s)?\b",
    )
    .expect("retry-after pattern is valid")
});

/// Extract a server-suggested retry interval from an error message.
///
/// Recognises "retry after N", "Retry-After: N", "try again in N seconds"
/// and "wait N seconds". Bare numbers are seconds; an `ms` suffix means
/// milliseconds.
pub fn suggested_retry_after(message: &str) -> Option<Duration> {
    let caps = RETRY_AFTER_RE.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let is_millis = caps
        .get(2)
        .map(|u| u.as_str().to_ascii_lowercase().starts_with('m'))
        .unwrap_or(false);
    let secs = if is_millis { value / 1000.0 } else { value };
    Duration::try_from_secs_f64(secs).ok()
}

/// What the retry loop should do with a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    Retry { suggested: Option<Duration> },
    GiveUp,
}

/// Classify an error by its message alone.
pub fn classify_message(message: &str) -> RetryVerdict {
    if is_rate_limit_error(message) {
        RetryVerdict::Retry {
            suggested: suggested_retry_after(message),
        }
    } else {
        RetryVerdict::GiveUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.initial_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(60));
        assert!((p.exponential_base - 2.0).abs() < f64::EPSILON);
        assert!(p.jitter);
    }

    #[test]
    fn rate_limit_markers() {
        assert!(is_rate_limit_error("HTTP 429 Too Many Requests"));
        assert!(is_rate_limit_error("Rate limit reached for gpt-4o"));
        assert!(is_rate_limit_error("request was throttled"));
        assert!(is_rate_limit_error("Quota exceeded for this deployment"));
        assert!(is_rate_limit_error("code: rate_limit_exceeded"));
    }

    #[test]
    fn non_rate_limit_messages() {
        assert!(!is_rate_limit_error("401 Unauthorized"));
        assert!(!is_rate_limit_error("invalid request: missing field `messages`"));
        assert!(!is_rate_limit_error("connection reset by peer"));
    }

    #[test]
    fn retry_after_phrasings() {
        assert_eq!(
            suggested_retry_after("Please retry after 7 seconds."),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            suggested_retry_after("Retry-After: 12"),
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            suggested_retry_after("Rate limit reached. Please try again in 2.5s."),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(
            suggested_retry_after("quota exceeded, wait 30 seconds"),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            suggested_retry_after("try again in 450ms"),
            Some(Duration::from_millis(450))
        );
        assert_eq!(suggested_retry_after("429 Too Many Requests"), None);
    }

    #[test]
    fn unrepresentable_retry_after_is_ignored() {
        assert_eq!(
            suggested_retry_after("429: retry after 99999999999999999999999 seconds"),
            None
        );
        assert_eq!(
            classify_message("429: retry after 99999999999999999999999 seconds"),
            RetryVerdict::Retry { suggested: None }
        );
    }

    #[test]
    fn exponential_growth_without_jitter() {
        let p = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(p.delay(0, None, 0.9), Duration::from_millis(100));
        assert_eq!(p.delay(1, None, 0.9), Duration::from_millis(200));
        assert_eq!(p.delay(2, None, 0.9), Duration::from_millis(400));
    }

    #[test]
    fn delay_capped_at_max() {
        let p = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        };
        assert_eq!(p.delay(10, None, 0.0), Duration::from_secs(5));
        assert_eq!(p.delay(0, Some(Duration::from_secs(90)), 0.0), Duration::from_secs(5));
    }

    #[test]
    fn suggested_delay_replaces_exponential_term() {
        let p = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(p.delay(3, Some(Duration::from_secs(2)), 0.0), Duration::from_secs(2));
    }

    #[test]
    fn jitter_adds_at_most_a_quarter() {
        let p = RetryPolicy {
            initial_delay: Duration::from_secs(4),
            ..Default::default()
        };
        assert_eq!(p.delay(0, None, 0.0), Duration::from_secs(4));
        let high = p.delay(0, None, 0.999_999);
        assert!(high > Duration::from_secs(4));
        assert!(high <= Duration::from_secs(5));
    }

    #[test]
    fn policy_serde_uses_millis() {
        let json = serde_json::to_value(RetryPolicy::default()).unwrap();
        assert_eq!(json["initial_delay"], 1000);
        assert_eq!(json["max_delay"], 60_000);

        let parsed: RetryPolicy = serde_json::from_str(r#"{"max_retries": 2}"#).unwrap();
        assert_eq!(parsed.max_retries, 2);
        assert_eq!(parsed.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn classify_message_verdicts() {
        assert_eq!(
            classify_message("429 Too Many Requests, retry after 2"),
            RetryVerdict::Retry {
                suggested: Some(Duration::from_secs(2))
            }
        );
        assert_eq!(
            classify_message("rate limit reached"),
            RetryVerdict::Retry { suggested: None }
        );
        assert_eq!(classify_message("invalid api key"), RetryVerdict::GiveUp);
    }
}
