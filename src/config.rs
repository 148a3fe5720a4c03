//! Runtime configuration.
//!
//! Configuration is loaded from a plain text file with one `key value`
//! directive per line. Blank lines and `#` comments are ignored. Unknown
//! keys and malformed values are startup errors, never silently skipped.
//!
//! Defaults:
//!
//! | Key                    | Default              |
//! |------------------------|----------------------|
//! | `cores_max`            | available parallelism|
//! | `cores_guaranteed`     | 1                    |
//! | `preempt_tick_us`      | 100                  |
//! | `elastic_interval_us`  | 5000                 |
//! | `load_high`            | 0.85                 |
//! | `load_low`             | 0.25                 |
//! | `standing_age_high_us` | 500                  |
//! | `stack_size_kb`        | 256                  |
//! | `thread_pool_cap`      | 64                   |
//! | `host_addr`            | unset                |

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

/// Configuration for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfig {
    /// Maximum number of cores the runtime may ever hold.
    pub cores_max: usize,
    /// Cores the runtime is entitled to without negotiation.
    pub cores_guaranteed: usize,
    /// Preemption tick: a thread running at least this long without a
    /// suspension point is marked preempt-pending.
    pub preempt_tick_us: u64,
    /// Interval between congestion aggregation / renegotiation rounds.
    pub elastic_interval_us: u64,
    /// Average load above which the runtime asks for another core.
    pub load_high: f32,
    /// Average load below which the runtime offers a core back.
    pub load_low: f32,
    /// Standing queue age above which the runtime asks for another core.
    pub standing_age_high_us: u64,
    /// Requested stack size for backing threads, in KiB.
    pub stack_size_kb: usize,
    /// Maximum number of idle backing threads kept for reuse.
    pub thread_pool_cap: usize,
    /// Network identity of this runtime instance, stored verbatim.
    pub host_addr: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            cores_max: parallelism,
            cores_guaranteed: 1,
            preempt_tick_us: 100,
            elastic_interval_us: 5_000,
            load_high: 0.85,
            load_low: 0.25,
            standing_age_high_us: 500,
            stack_size_kb: 256,
            thread_pool_cap: 64,
            host_addr: None,
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Error::with_message(ErrorKind::ConfigError, format!("{}: {e}", path.display()))
        })?;
        Self::from_str_contents(&text)
    }

    /// Parses a configuration from file contents.
    pub fn from_str_contents(text: &str) -> Result<Self> {
        let mut cfg = Self::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let key = parts.next().unwrap_or("");
            let value = parts.next().ok_or_else(|| bad_line(lineno, "missing value"))?;
            if parts.next().is_some() {
                return Err(bad_line(lineno, "trailing tokens"));
            }
            match key {
                "cores_max" => cfg.cores_max = parse_num(lineno, key, value)?,
                "cores_guaranteed" => cfg.cores_guaranteed = parse_num(lineno, key, value)?,
                "preempt_tick_us" => cfg.preempt_tick_us = parse_num(lineno, key, value)?,
                "elastic_interval_us" => cfg.elastic_interval_us = parse_num(lineno, key, value)?,
                "load_high" => cfg.load_high = parse_num(lineno, key, value)?,
                "load_low" => cfg.load_low = parse_num(lineno, key, value)?,
                "standing_age_high_us" => cfg.standing_age_high_us = parse_num(lineno, key, value)?,
                "stack_size_kb" => cfg.stack_size_kb = parse_num(lineno, key, value)?,
                "thread_pool_cap" => cfg.thread_pool_cap = parse_num(lineno, key, value)?,
                "host_addr" => cfg.host_addr = Some(value.to_string()),
                other => {
                    return Err(bad_line(lineno, format!("unknown key `{other}`")));
                }
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.cores_guaranteed == 0 {
            return Err(invalid("cores_guaranteed must be at least 1"));
        }
        if self.cores_guaranteed > self.cores_max {
            return Err(invalid(format!(
                "cores_guaranteed ({}) exceeds cores_max ({})",
                self.cores_guaranteed, self.cores_max
            )));
        }
        if self.preempt_tick_us == 0 {
            return Err(invalid("preempt_tick_us must be non-zero"));
        }
        if self.elastic_interval_us == 0 {
            return Err(invalid("elastic_interval_us must be non-zero"));
        }
        if !(self.load_low >= 0.0 && self.load_low < self.load_high && self.load_high <= 1.0) {
            return Err(invalid(format!(
                "load thresholds must satisfy 0 <= load_low < load_high <= 1, got {} / {}",
                self.load_low, self.load_high
            )));
        }
        if self.stack_size_kb == 0 {
            return Err(invalid("stack_size_kb must be non-zero"));
        }
        Ok(())
    }
}

fn bad_line(lineno: usize, detail: impl std::fmt::Display) -> Error {
    Error::with_message(ErrorKind::ConfigError, format!("line {}: {detail}", lineno + 1))
}

fn invalid(detail: impl Into<String>) -> Error {
    Error::with_message(ErrorKind::ConfigError, detail)
}

fn parse_num<T: std::str::FromStr>(lineno: usize, key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| bad_line(lineno, format!("bad value `{value}` for `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_directives_and_comments() {
        let cfg = RuntimeConfig::from_str_contents(
            "# test config\n\
             cores_max 8\n\
             cores_guaranteed 2   # inline comment\n\
             preempt_tick_us 50\n\
             host_addr 192.168.1.7:5000\n\
             \n",
        )
        .expect("config should parse");
        assert_eq!(cfg.cores_max, 8);
        assert_eq!(cfg.cores_guaranteed, 2);
        assert_eq!(cfg.preempt_tick_us, 50);
        assert_eq!(cfg.host_addr.as_deref(), Some("192.168.1.7:5000"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = RuntimeConfig::from_str_contents("corez_max 8\n").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigError);
        assert!(err.to_string().contains("unknown key"), "{err}");
    }

    #[test]
    fn malformed_value_is_rejected() {
        let err = RuntimeConfig::from_str_contents("cores_max eight\n").unwrap_err();
        assert!(err.to_string().contains("line 1"), "{err}");
    }

    #[test]
    fn missing_value_is_rejected() {
        assert!(RuntimeConfig::from_str_contents("cores_max\n").is_err());
    }

    #[test]
    fn guaranteed_above_max_is_rejected() {
        let err =
            RuntimeConfig::from_str_contents("cores_max 2\ncores_guaranteed 4\n").unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[test]
    fn zero_tick_is_rejected() {
        assert!(RuntimeConfig::from_str_contents("preempt_tick_us 0\n").is_err());
    }

    #[test]
    fn defaults_validate() {
        RuntimeConfig::default().validate().expect("defaults must be valid");
    }

    proptest! {
        #[test]
        fn numeric_directives_round_trip(
            max in 1usize..=256,
            tick in 1u64..=100_000,
            age in 0u64..=10_000_000,
            pool in 0usize..=1024,
        ) {
            let guaranteed = 1 + max / 2;
            let text = format!(
                "cores_max {max}\ncores_guaranteed {}\npreempt_tick_us {tick}\n\
                 standing_age_high_us {age}\nthread_pool_cap {pool}\n",
                guaranteed.min(max),
            );
            let cfg = RuntimeConfig::from_str_contents(&text).unwrap();
            prop_assert_eq!(cfg.cores_max, max);
            prop_assert_eq!(cfg.preempt_tick_us, tick);
            prop_assert_eq!(cfg.standing_age_high_us, age);
            prop_assert_eq!(cfg.thread_pool_cap, pool);
        }
    }
}
