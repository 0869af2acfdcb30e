//! Identity categories and effective limit computation.
//!
//! Category and limit are recomputed from stored behavior on every
//! evaluation, so an identity's allowance tightens or relaxes as its
//! recorded behavior changes, without any per-identity state in this
//! module.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use super::behavior::BehaviorMetrics;
use super::Identity;
use crate::error::ConfigError;

const POWER_MIN_AGE_DAYS: u64 = 30;
const POWER_MIN_SUCCESSES: u64 = 1000;
const POWER_MAX_ERROR_RATE: f64 = 0.05;
const NEW_ACCOUNT_MAX_AGE_DAYS: u64 = 1;

/// Trust tier an identity is assigned for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Category {
    New,
    Normal,
    Power,
    Suspicious,
    Blocked,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::New,
        Category::Normal,
        Category::Power,
        Category::Suspicious,
        Category::Blocked,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Category::New => "NEW",
            Category::Normal => "NORMAL",
            Category::Power => "POWER",
            Category::Suspicious => "SUSPICIOUS",
            Category::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assign a category from current block/suspicion state and stored
/// behavior. First match wins; the order is part of the contract.
pub fn categorize(
    identity: &Identity,
    behavior: &BehaviorMetrics,
    blocked: bool,
    suspicious: bool,
) -> Category {
    if blocked {
        return Category::Blocked;
    }
    if suspicious {
        return Category::Suspicious;
    }
    if identity.is_anonymous() {
        return Category::New;
    }
    if behavior.account_age_days > POWER_MIN_AGE_DAYS
        && behavior.successful_requests > POWER_MIN_SUCCESSES
        && behavior.error_rate < POWER_MAX_ERROR_RATE
    {
        return Category::Power;
    }
    if behavior.account_age_days < NEW_ACCOUNT_MAX_AGE_DAYS {
        return Category::New;
    }
    Category::Normal
}

/// Base allowance for one category.
#[derive(Debug, Clone)]
pub struct CategoryLimit {
    /// Requests allowed per window before penalties.
    pub max_requests: u32,
    pub window: Duration,
    /// How long a block lasts when this category trips one.
    pub block_duration: Duration,
}

/// Per-category base limits.
#[derive(Debug, Clone)]
pub struct LimitTable {
    new: CategoryLimit,
    normal: CategoryLimit,
    power: CategoryLimit,
    suspicious: CategoryLimit,
    blocked: CategoryLimit,
}

impl Default for LimitTable {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        Self {
            new: CategoryLimit {
                max_requests: 30,
                window: minute,
                block_duration: Duration::from_secs(600),
            },
            normal: CategoryLimit {
                max_requests: 60,
                window: minute,
                block_duration: Duration::from_secs(600),
            },
            power: CategoryLimit {
                max_requests: 180,
                window: minute,
                block_duration: Duration::from_secs(300),
            },
            suspicious: CategoryLimit {
                max_requests: 10,
                window: minute,
                block_duration: Duration::from_secs(1800),
            },
            blocked: CategoryLimit {
                max_requests: 0,
                window: minute,
                block_duration: Duration::from_secs(3600),
            },
        }
    }
}

impl LimitTable {
    #[must_use]
    pub fn limit(&self, category: Category) -> &CategoryLimit {
        match category {
            Category::New => &self.new,
            Category::Normal => &self.normal,
            Category::Power => &self.power,
            Category::Suspicious => &self.suspicious,
            Category::Blocked => &self.blocked,
        }
    }

    pub fn set(&mut self, category: Category, limit: CategoryLimit) {
        match category {
            Category::New => self.new = limit,
            Category::Normal => self.normal = limit,
            Category::Power => self.power = limit,
            Category::Suspicious => self.suspicious = limit,
            Category::Blocked => self.blocked = limit,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &CategoryLimit)> {
        Category::ALL
            .into_iter()
            .map(move |category| (category, self.limit(category)))
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (category, limit) in self.iter() {
            if limit.window.is_zero() {
                return Err(ConfigError::ZeroWindow {
                    category: category.as_str(),
                });
            }
        }
        Ok(())
    }
}

/// Endpoint-name → limit multiplier. Lookups are exact; unknown endpoints
/// use 1.0.
#[derive(Debug, Clone)]
pub struct EndpointMultipliers {
    multipliers: HashMap<String, f64>,
}

impl Default for EndpointMultipliers {
    fn default() -> Self {
        let mut multipliers = HashMap::new();
        // Authentication is the abuse magnet; health checks are harmless.
        multipliers.insert("auth".to_string(), 0.5);
        multipliers.insert("health".to_string(), 2.0);
        Self { multipliers }
    }
}

impl EndpointMultipliers {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            multipliers: HashMap::new(),
        }
    }

    pub fn set(&mut self, endpoint: impl Into<String>, multiplier: f64) {
        self.multipliers.insert(endpoint.into(), multiplier);
    }

    #[must_use]
    pub fn for_endpoint(&self, endpoint: &str) -> f64 {
        self.multipliers.get(endpoint).copied().unwrap_or(1.0)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (endpoint, multiplier) in &self.multipliers {
            if *multiplier <= 0.0 {
                return Err(ConfigError::NonPositiveMultiplier {
                    endpoint: endpoint.clone(),
                    value: *multiplier,
                });
            }
        }
        Ok(())
    }
}

/// Allowance for one (category, endpoint, behavior) combination.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveLimit {
    pub category: Category,
    pub max_requests: u32,
    #[serde(skip)]
    pub window: Duration,
    #[serde(skip)]
    pub block_duration: Duration,
}

/// Computes effective limits from the category table, endpoint multipliers,
/// and behavior penalties.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    limits: LimitTable,
    multipliers: EndpointMultipliers,
}

impl PolicyResolver {
    pub(crate) fn new(limits: LimitTable, multipliers: EndpointMultipliers) -> Self {
        Self {
            limits,
            multipliers,
        }
    }

    /// Effective limit for an endpoint: base × endpoint multiplier, then
    /// behavior penalties, floored and clamped to at least one request.
    /// BLOCKED always computes to zero.
    #[must_use]
    pub fn compute_limit(
        &self,
        category: Category,
        endpoint: &str,
        behavior: &BehaviorMetrics,
    ) -> EffectiveLimit {
        self.limit_with_multiplier(category, self.multipliers.for_endpoint(endpoint), behavior)
    }

    /// Endpoint-neutral limit (multiplier 1.0), used for status reporting.
    #[must_use]
    pub fn baseline_limit(&self, category: Category, behavior: &BehaviorMetrics) -> EffectiveLimit {
        self.limit_with_multiplier(category, 1.0, behavior)
    }

    fn limit_with_multiplier(
        &self,
        category: Category,
        multiplier: f64,
        behavior: &BehaviorMetrics,
    ) -> EffectiveLimit {
        let base = self.limits.limit(category);
        let mut max = f64::from(base.max_requests) * multiplier;
        let mut block_duration = base.block_duration;

        // Penalties apply multiplicatively, in this order.
        if behavior.error_rate > 0.3 {
            max *= 0.5;
        }
        if behavior.failed_auth_attempts > 5 {
            max *= 0.3;
            block_duration *= 2;
        }
        if behavior.rapid_requests > 10 {
            max *= 0.7;
        }

        let max_requests = if category == Category::Blocked {
            0
        } else {
            (max.floor() as u32).max(1)
        };
        EffectiveLimit {
            category,
            max_requests,
            window: base.window,
            block_duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PolicyResolver {
        PolicyResolver::new(LimitTable::default(), EndpointMultipliers::default())
    }

    fn user() -> Identity {
        Identity::user("u1")
    }

    fn quiet() -> BehaviorMetrics {
        BehaviorMetrics::default()
    }

    #[test]
    fn block_state_wins_over_everything() {
        let behavior = BehaviorMetrics {
            account_age_days: 90,
            successful_requests: 5000,
            ..quiet()
        };
        assert_eq!(
            categorize(&user(), &behavior, true, true),
            Category::Blocked
        );
    }

    #[test]
    fn suspicion_wins_over_trust() {
        let behavior = BehaviorMetrics {
            account_age_days: 90,
            successful_requests: 5000,
            ..quiet()
        };
        assert_eq!(
            categorize(&user(), &behavior, false, true),
            Category::Suspicious
        );
    }

    #[test]
    fn anonymous_identities_are_always_new() {
        let behavior = BehaviorMetrics {
            account_age_days: 90,
            successful_requests: 5000,
            ..quiet()
        };
        assert_eq!(
            categorize(&Identity::anonymous("10.0.0.1"), &behavior, false, false),
            Category::New
        );
    }

    #[test]
    fn power_thresholds_are_strict() {
        let power = BehaviorMetrics {
            account_age_days: 31,
            successful_requests: 1001,
            error_rate: 0.04,
            ..quiet()
        };
        assert_eq!(categorize(&user(), &power, false, false), Category::Power);

        let at_age_boundary = BehaviorMetrics {
            account_age_days: 30,
            ..power.clone()
        };
        assert_eq!(
            categorize(&user(), &at_age_boundary, false, false),
            Category::Normal
        );

        let at_success_boundary = BehaviorMetrics {
            successful_requests: 1000,
            ..power.clone()
        };
        assert_eq!(
            categorize(&user(), &at_success_boundary, false, false),
            Category::Normal
        );

        let at_error_boundary = BehaviorMetrics {
            error_rate: 0.05,
            ..power
        };
        assert_eq!(
            categorize(&user(), &at_error_boundary, false, false),
            Category::Normal
        );
    }

    #[test]
    fn young_accounts_are_new_then_normal() {
        let young = BehaviorMetrics {
            account_age_days: 0,
            ..quiet()
        };
        assert_eq!(categorize(&user(), &young, false, false), Category::New);

        let settled = BehaviorMetrics {
            account_age_days: 3,
            ..quiet()
        };
        assert_eq!(categorize(&user(), &settled, false, false), Category::Normal);
    }

    #[test]
    fn endpoint_multiplier_halves_the_auth_budget() {
        let limit = resolver().compute_limit(Category::Normal, "auth", &quiet());
        assert_eq!(limit.max_requests, 30);
        assert_eq!(limit.window, Duration::from_secs(60));
    }

    #[test]
    fn unknown_endpoint_uses_base_limit() {
        let limit = resolver().compute_limit(Category::Normal, "projects", &quiet());
        assert_eq!(limit.max_requests, 60);
    }

    #[test]
    fn penalties_stack_in_order_and_double_the_block() {
        let behavior = BehaviorMetrics {
            error_rate: 0.4,
            failed_auth_attempts: 6,
            rapid_requests: 11,
            ..quiet()
        };
        let limit = resolver().compute_limit(Category::Normal, "projects", &behavior);
        // 60 × 0.5 × 0.3 × 0.7 = 6.3 → 6
        assert_eq!(limit.max_requests, 6);
        assert_eq!(limit.block_duration, Duration::from_secs(1200));
    }

    #[test]
    fn penalized_limit_never_drops_below_one() {
        let behavior = BehaviorMetrics {
            error_rate: 0.9,
            failed_auth_attempts: 20,
            rapid_requests: 40,
            ..quiet()
        };
        let limit = resolver().compute_limit(Category::Suspicious, "auth", &behavior);
        // 10 × 0.5 × 0.5 × 0.3 × 0.7 = 0.525 → floor 0 → clamp 1
        assert_eq!(limit.max_requests, 1);
    }

    #[test]
    fn blocked_category_computes_to_zero() {
        let limit = resolver().compute_limit(Category::Blocked, "health", &quiet());
        assert_eq!(limit.max_requests, 0);
    }

    #[test]
    fn baseline_ignores_endpoint_multipliers() {
        let resolver = resolver();
        let baseline = resolver.baseline_limit(Category::Power, &quiet());
        assert_eq!(baseline.max_requests, 180);
    }

    #[test]
    fn zero_window_fails_validation() {
        let mut table = LimitTable::default();
        table.set(
            Category::New,
            CategoryLimit {
                max_requests: 10,
                window: Duration::ZERO,
                block_duration: Duration::from_secs(60),
            },
        );
        assert!(matches!(
            table.validate(),
            Err(ConfigError::ZeroWindow { category: "NEW" })
        ));
    }

    #[test]
    fn non_positive_multiplier_fails_validation() {
        let mut multipliers = EndpointMultipliers::empty();
        multipliers.set("auth", 0.0);
        assert!(matches!(
            multipliers.validate(),
            Err(ConfigError::NonPositiveMultiplier { .. })
        ));
    }
}
