//! Relationship-driven invalidation and cross-instance fan-out.
//!
//! The cascade table maps an entity type to the key patterns that must be
//! dropped when one of its entities changes, plus the entity types whose own
//! patterns are dropped alongside (one level, no recursion). The table is
//! validated when the gate is built: patterns need an id placeholder,
//! cascade targets must exist, and cycles are rejected.
//!
//! Fan-out events let other instances drop their local copies after a
//! store-side invalidation; they travel over the store's pub/sub channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Invalidation behavior for one entity type.
#[derive(Debug, Clone, Default)]
pub struct CascadeRule {
    /// Key patterns invalidated directly. The first `*` is replaced by the
    /// entity id; any further wildcards stay glob wildcards.
    pub direct_patterns: Vec<String>,
    /// Entity types whose direct patterns are also invalidated, with the
    /// same id.
    pub cascade_types: Vec<String>,
}

impl CascadeRule {
    #[must_use]
    pub fn new(direct_patterns: Vec<String>, cascade_types: Vec<String>) -> Self {
        Self {
            direct_patterns,
            cascade_types,
        }
    }
}

/// Entity-type → invalidation-rule table.
#[derive(Debug, Clone, Default)]
pub struct CascadeTable {
    rules: HashMap<String, CascadeRule>,
}

impl CascadeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity_type: impl Into<String>, rule: CascadeRule) {
        self.rules.insert(entity_type.into(), rule);
    }

    #[must_use]
    pub fn rule(&self, entity_type: &str) -> Option<&CascadeRule> {
        self.rules.get(entity_type)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Reject malformed patterns, dangling cascade targets, and cycles.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (entity, rule) in &self.rules {
            for pattern in &rule.direct_patterns {
                if !pattern.contains('*') {
                    return Err(ConfigError::MalformedCascadePattern {
                        entity: entity.clone(),
                        pattern: pattern.clone(),
                    });
                }
            }
            for target in &rule.cascade_types {
                if !self.rules.contains_key(target) {
                    return Err(ConfigError::UnknownCascadeTarget {
                        entity: entity.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        self.detect_cycle()
    }

    fn detect_cycle(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InStack,
            Done,
        }

        fn visit<'a>(
            table: &'a CascadeTable,
            marks: &mut HashMap<&'a str, Mark>,
            entity: &'a str,
        ) -> Result<(), ConfigError> {
            match marks.get(entity) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InStack) => {
                    return Err(ConfigError::CyclicCascade {
                        entity: entity.to_string(),
                    });
                }
                None => {}
            }
            marks.insert(entity, Mark::InStack);
            if let Some(rule) = table.rules.get(entity) {
                for target in &rule.cascade_types {
                    visit(table, marks, target)?;
                }
            }
            marks.insert(entity, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for entity in self.rules.keys() {
            visit(self, &mut marks, entity)?;
        }
        Ok(())
    }
}

/// Substitute an entity id into a direct pattern. Only the first `*` is the
/// id placeholder; later wildcards survive for the store-side glob.
pub(crate) fn substitute_id(pattern: &str, id: &str) -> String {
    pattern.replacen('*', id, 1)
}

/// Message broadcast to sibling instances after a store-side invalidation.
/// Receivers drop the named keys from their local tier only; the sender
/// already removed them from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvalidationEvent {
    Remove { origin: Uuid, key: String },
    RemovePattern { origin: Uuid, pattern: String },
}

/// Cross-instance invalidation settings. Disabled by default; single
/// instances have nobody to tell.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub enabled: bool,
    pub channel: String,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: "cache:invalidate".to_string(),
        }
    }
}
