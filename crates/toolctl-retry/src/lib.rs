//! Backoff strategies for transient failures: deep-profile probes that time
//! out, `retry_with_modifier` remediation options, and chain re-execution
//! after an escalation resolves. Pure computation — no sleeping, no I/O; the
//! caller owns the actual wait.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    Immediate,
    Constant,
    Linear,
    Exponential,
}

/// Serializes as either a humantime string (`"500ms"`) or a millisecond
/// integer, matching config files that predate this crate's duration type.
fn serialize_duration<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_u64(d.as_millis() as u64)
}

fn deserialize_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(u64),
        Text(String),
    }

    match Repr::deserialize(d)? {
        Repr::Millis(ms) => Ok(Duration::from_millis(ms)),
        Repr::Text(raw) => humantime::parse_duration(&raw)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {raw:?}: {e}"))),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    pub strategy: RetryStrategyType,
    pub max_attempts: u32,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub max_delay: Duration,
    #[serde(default)]
    pub jitter: bool,
}

impl RetryStrategyConfig {
    pub const fn none() -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 1,
            base_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(0),
            jitter: false,
        }
    }

    pub const fn probe_default() -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }

    pub const fn remediation_default() -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

/// Delay before the `attempt`-th retry (1-indexed: `attempt == 1` is the
/// first retry, following the initial try). Returns `None` once
/// `max_attempts` is exhausted.
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Option<Duration> {
    if attempt == 0 || attempt > config.max_attempts {
        return None;
    }

    let raw = match config.strategy {
        RetryStrategyType::Immediate => Duration::from_millis(0),
        RetryStrategyType::Constant => config.base_delay,
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Exponential => {
            let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
            config.base_delay.saturating_mul(factor)
        }
    };

    let capped = raw.min(config.max_delay);
    Some(if config.jitter {
        apply_jitter(capped)
    } else {
        capped
    })
}

/// Full jitter: uniform in `[0, capped]`, so concurrent retries of the same
/// failure spread out instead of thundering back in lockstep.
fn apply_jitter(capped: Duration) -> Duration {
    let factor = rand::random::<f64>();
    Duration::from_secs_f64(capped.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_capped() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(calculate_delay(&config, 1), Some(Duration::from_millis(100)));
        assert_eq!(calculate_delay(&config, 2), Some(Duration::from_millis(200)));
        assert_eq!(calculate_delay(&config, 3), Some(Duration::from_millis(400)));
        assert_eq!(calculate_delay(&config, 4), Some(Duration::from_millis(500)));
        assert_eq!(calculate_delay(&config, 5), Some(Duration::from_millis(500)));
    }

    #[test]
    fn exhausted_attempts_return_none() {
        let config = RetryStrategyConfig::probe_default();
        assert_eq!(calculate_delay(&config, 0), None);
        assert_eq!(
            calculate_delay(&config, config.max_attempts + 1),
            None
        );
    }

    #[test]
    fn linear_scales_by_attempt_number() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(calculate_delay(&config, 2), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_never_exceeds_the_uncapped_delay() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            max_attempts: 1,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(300),
            jitter: true,
        };
        for _ in 0..50 {
            let delay = calculate_delay(&config, 1).expect("within attempts");
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn duration_deserializes_from_millis_or_humantime() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "deserialize_duration")]
            d: Duration,
        }
        let from_text: Wrapper = serde_json::from_str(r#"{"d": "2s"}"#).unwrap();
        assert_eq!(from_text.d, Duration::from_secs(2));
        let from_num: Wrapper = serde_json::from_str(r#"{"d": 1500}"#).unwrap();
        assert_eq!(from_num.d, Duration::from_millis(1500));
    }
}
