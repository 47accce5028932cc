use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::config::TenantFilterConfig;
use crate::events::EntityType;

/// How an indirectly scoped entity finds its parent
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TenantLookupRule {
    pub entity: EntityType,
    pub parent: EntityType,
    /// Field on `entity` holding the parent's id
    pub foreign_key: String,
}

impl TenantLookupRule {
    pub fn new(entity: EntityType, parent: EntityType, foreign_key: impl Into<String>) -> Self {
        Self {
            entity,
            parent,
            foreign_key: foreign_key.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupRuleError {
    #[error("entity {0} has more than one lookup rule")]
    DuplicateRule(EntityType),
    #[error("lookup chain starting at {0} never reaches a directly scoped entity")]
    Cycle(EntityType),
}

/// Static mapping from indirectly scoped entity types to their parents.
///
/// Every entity type either carries its tenant directly (no rule) or has
/// exactly one rule, and every chain ends at a directly scoped entity.
#[derive(Debug, Clone)]
pub struct LookupRules {
    rules: HashMap<EntityType, TenantLookupRule>,
}

impl LookupRules {
    pub fn new(rules: impl IntoIterator<Item = TenantLookupRule>) -> Result<Self, LookupRuleError> {
        let mut map = HashMap::new();
        for rule in rules {
            let entity = rule.entity;
            if map.insert(entity, rule).is_some() {
                return Err(LookupRuleError::DuplicateRule(entity));
            }
        }

        let table = Self { rules: map };
        for entity in table.rules.keys() {
            if table.chain(*entity).len() > table.rules.len() {
                return Err(LookupRuleError::Cycle(*entity));
            }
        }

        Ok(table)
    }

    /// Rules from configuration, falling back to the built-in table
    pub fn from_config(config: &TenantFilterConfig) -> Result<Self, LookupRuleError> {
        if config.rules.is_empty() {
            return Ok(Self::default());
        }
        Self::new(config.rules.iter().cloned())
    }

    pub fn rule_for(&self, entity: EntityType) -> Option<&TenantLookupRule> {
        self.rules.get(&entity)
    }

    /// Whether change events for this entity carry the tenant id themselves
    pub fn is_direct(&self, entity: EntityType) -> bool {
        !self.rules.contains_key(&entity)
    }

    /// Rules followed from `entity` up to a directly scoped ancestor.
    ///
    /// Stops after `rules.len() + 1` hops so a cyclic table is detectable.
    pub fn chain(&self, entity: EntityType) -> Vec<&TenantLookupRule> {
        let mut chain = Vec::new();
        let mut current = entity;
        while let Some(rule) = self.rules.get(&current) {
            chain.push(rule);
            if chain.len() > self.rules.len() {
                break;
            }
            current = rule.parent;
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for LookupRules {
    fn default() -> Self {
        Self {
            rules: [
                TenantLookupRule::new(EntityType::Assignment, EntityType::Job, "job_id"),
                TenantLookupRule::new(EntityType::Bid, EntityType::Opportunity, "opportunity_id"),
                TenantLookupRule::new(EntityType::ComplianceItem, EntityType::Contract, "contract_id"),
            ]
            .into_iter()
            .map(|rule| (rule.entity, rule))
            .collect(),
        }
    }
}
