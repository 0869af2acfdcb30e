//! Named cache strategies and the policies behind them.
//!
//! A strategy is the only cache tuning knob callers see. Each one maps to a
//! [`StrategyPolicy`] fixing TTL, local-tier admission and capacity, and the
//! compression rule; the table ships with defaults and can be overridden
//! per strategy through the builder.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Named access-pattern profile for a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheStrategy {
    /// Small, frequently read values. Short TTL, always local, never
    /// compressed.
    Hot,
    /// Moderately accessed values. Medium TTL, local, compressed when large.
    Warm,
    /// Large or rarely read values. Long TTL, distributed only, always
    /// compressed.
    Cold,
    /// Rarely changing configuration-like values. Longest TTL, local,
    /// compressed when large.
    Static,
}

impl CacheStrategy {
    pub const ALL: [CacheStrategy; 4] = [
        CacheStrategy::Hot,
        CacheStrategy::Warm,
        CacheStrategy::Cold,
        CacheStrategy::Static,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStrategy::Hot => "HOT",
            CacheStrategy::Warm => "WARM",
            CacheStrategy::Cold => "COLD",
            CacheStrategy::Static => "STATIC",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = ConfigError;

    /// Parse a strategy name, case-insensitively. Unknown names fail fast at
    /// the call site rather than caching under a default policy.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConfigError::UnknownStrategy(s.to_string()))
    }
}

/// When to gzip the serialized payload before it goes to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Never,
    /// Compress only payloads larger than this many serialized bytes.
    OverBytes(usize),
    Always,
}

impl Compression {
    pub(crate) fn applies_to(self, serialized_len: usize) -> bool {
        match self {
            Compression::Never => false,
            Compression::OverBytes(threshold) => serialized_len > threshold,
            Compression::Always => true,
        }
    }
}

/// Concrete caching behavior for one strategy.
#[derive(Debug, Clone)]
pub struct StrategyPolicy {
    /// Lifetime of an entry in both tiers.
    pub ttl: Duration,
    /// Whether entries are admitted to the process-local tier at all.
    pub local_cacheable: bool,
    /// Local-tier capacity for this strategy. Ignored when not local.
    pub max_local_items: usize,
    pub compression: Compression,
}

impl StrategyPolicy {
    /// The stock policy for a strategy, handy as a base for overrides:
    ///
    /// ```rust
    /// use adaptive_gate::{CacheStrategy, StrategyPolicy};
    ///
    /// let policy = StrategyPolicy {
    ///     ttl: std::time::Duration::from_secs(120),
    ///     ..StrategyPolicy::default_for(CacheStrategy::Hot)
    /// };
    /// ```
    #[must_use]
    pub fn default_for(strategy: CacheStrategy) -> Self {
        PolicyTable::default().policy(strategy).clone()
    }
}

/// Per-strategy policy table.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    hot: StrategyPolicy,
    warm: StrategyPolicy,
    cold: StrategyPolicy,
    static_: StrategyPolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            hot: StrategyPolicy {
                ttl: Duration::from_secs(300),
                local_cacheable: true,
                max_local_items: 1000,
                compression: Compression::Never,
            },
            warm: StrategyPolicy {
                ttl: Duration::from_secs(600),
                local_cacheable: true,
                max_local_items: 500,
                compression: Compression::OverBytes(1024),
            },
            cold: StrategyPolicy {
                ttl: Duration::from_secs(1800),
                local_cacheable: false,
                max_local_items: 0,
                compression: Compression::Always,
            },
            static_: StrategyPolicy {
                ttl: Duration::from_secs(3600),
                local_cacheable: true,
                max_local_items: 250,
                compression: Compression::OverBytes(1024),
            },
        }
    }
}

impl PolicyTable {
    #[must_use]
    pub fn policy(&self, strategy: CacheStrategy) -> &StrategyPolicy {
        match strategy {
            CacheStrategy::Hot => &self.hot,
            CacheStrategy::Warm => &self.warm,
            CacheStrategy::Cold => &self.cold,
            CacheStrategy::Static => &self.static_,
        }
    }

    pub fn set(&mut self, strategy: CacheStrategy, policy: StrategyPolicy) {
        match strategy {
            CacheStrategy::Hot => self.hot = policy,
            CacheStrategy::Warm => self.warm = policy,
            CacheStrategy::Cold => self.cold = policy,
            CacheStrategy::Static => self.static_ = policy,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (CacheStrategy, &StrategyPolicy)> {
        CacheStrategy::ALL
            .into_iter()
            .map(move |strategy| (strategy, self.policy(strategy)))
    }

    /// Reject tables that could never serve an entry.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (strategy, policy) in self.iter() {
            if policy.ttl.is_zero() {
                return Err(ConfigError::ZeroTtl {
                    strategy: strategy.as_str(),
                });
            }
            if policy.local_cacheable && policy.max_local_items == 0 {
                return Err(ConfigError::ZeroLocalCapacity {
                    strategy: strategy.as_str(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("hot".parse::<CacheStrategy>().unwrap(), CacheStrategy::Hot);
        assert_eq!("WARM".parse::<CacheStrategy>().unwrap(), CacheStrategy::Warm);
        assert_eq!("Cold".parse::<CacheStrategy>().unwrap(), CacheStrategy::Cold);
        assert_eq!(
            "static".parse::<CacheStrategy>().unwrap(),
            CacheStrategy::Static
        );
    }

    #[test]
    fn unknown_name_is_a_config_error() {
        let err = "lukewarm".parse::<CacheStrategy>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownStrategy(name) if name == "lukewarm"));
    }

    #[test]
    fn default_ttls_grow_from_hot_to_static() {
        let table = PolicyTable::default();
        let hot = table.policy(CacheStrategy::Hot).ttl;
        let warm = table.policy(CacheStrategy::Warm).ttl;
        let cold = table.policy(CacheStrategy::Cold).ttl;
        let static_ = table.policy(CacheStrategy::Static).ttl;
        assert!(hot < warm && warm < cold && cold < static_);
    }

    #[test]
    fn cold_entries_stay_out_of_the_local_tier() {
        let table = PolicyTable::default();
        assert!(!table.policy(CacheStrategy::Cold).local_cacheable);
        assert!(table.policy(CacheStrategy::Hot).local_cacheable);
    }

    #[test]
    fn compression_thresholds() {
        assert!(!Compression::Never.applies_to(usize::MAX));
        assert!(Compression::Always.applies_to(0));
        assert!(!Compression::OverBytes(1024).applies_to(1024));
        assert!(Compression::OverBytes(1024).applies_to(1025));
    }

    #[test]
    fn zero_ttl_fails_validation() {
        let mut table = PolicyTable::default();
        table.set(
            CacheStrategy::Hot,
            StrategyPolicy {
                ttl: Duration::ZERO,
                local_cacheable: true,
                max_local_items: 10,
                compression: Compression::Never,
            },
        );
        assert!(matches!(
            table.validate(),
            Err(ConfigError::ZeroTtl { strategy: "HOT" })
        ));
    }

    #[test]
    fn local_strategy_needs_capacity() {
        let mut table = PolicyTable::default();
        table.set(
            CacheStrategy::Warm,
            StrategyPolicy {
                ttl: Duration::from_secs(60),
                local_cacheable: true,
                max_local_items: 0,
                compression: Compression::Never,
            },
        );
        assert!(matches!(
            table.validate(),
            Err(ConfigError::ZeroLocalCapacity { strategy: "WARM" })
        ));
    }
}
