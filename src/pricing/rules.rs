use std::cmp::Reverse;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_NAME_LEN;
use crate::model::{Ms, SpotSize, VehicleClass};

use super::strategy::{StrategyConfig, StrategyKind};

/// Facility-scoped pricing policy. Read-only from the engine's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingRule {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub name: String,
    pub config: StrategyConfig,
    /// Empty = all classes.
    pub vehicle_classes: Vec<VehicleClass>,
    /// Empty = all sizes.
    pub spot_sizes: Vec<SpotSize>,
    /// Higher wins.
    pub priority: i32,
    pub free_minutes: u32,
    /// Charged per started hour past the booking's grace end.
    pub overstay_penalty_rate: Decimal,
    pub valid_from: Option<Ms>,
    pub valid_until: Option<Ms>,
    pub active: bool,
    pub created_at: Ms,
}

impl PricingRule {
    pub fn new(facility_id: Ulid, name: impl Into<String>, config: StrategyConfig, created_at: Ms) -> Self {
        Self {
            id: Ulid::new(),
            facility_id,
            name: name.into(),
            config,
            vehicle_classes: Vec::new(),
            spot_sizes: Vec::new(),
            priority: 0,
            free_minutes: 0,
            overstay_penalty_rate: Decimal::ZERO,
            valid_from: None,
            valid_until: None,
            active: true,
            created_at,
        }
    }

    /// Build a rule from the catalog's `(strategy, config document)` pair.
    pub fn from_json(
        facility_id: Ulid,
        name: impl Into<String>,
        strategy: &str,
        config: &serde_json::Value,
        created_at: Ms,
    ) -> Result<Self, EngineError> {
        let kind: StrategyKind = strategy.parse()?;
        let config = StrategyConfig::from_json(kind, config)?;
        Ok(Self::new(facility_id, name, config, created_at))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_free_minutes(mut self, minutes: u32) -> Self {
        self.free_minutes = minutes;
        self
    }

    pub fn with_overstay_penalty(mut self, rate: Decimal) -> Self {
        self.overstay_penalty_rate = rate;
        self
    }

    pub fn for_vehicle_classes(mut self, classes: impl IntoIterator<Item = VehicleClass>) -> Self {
        self.vehicle_classes = classes.into_iter().collect();
        self
    }

    pub fn for_spot_sizes(mut self, sizes: impl IntoIterator<Item = SpotSize>) -> Self {
        self.spot_sizes = sizes.into_iter().collect();
        self
    }

    pub fn valid_between(mut self, from: Option<Ms>, until: Option<Ms>) -> Self {
        self.valid_from = from;
        self.valid_until = until;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("rule name too long"));
        }
        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until)
            && from > until
        {
            return Err(EngineError::InvalidConfig("valid_from after valid_until".into()));
        }
        if self.overstay_penalty_rate.is_sign_negative() && !self.overstay_penalty_rate.is_zero() {
            return Err(EngineError::InvalidConfig("overstay penalty must not be negative".into()));
        }
        self.config.validate()
    }

    pub fn is_valid_at(&self, now: Ms) -> bool {
        self.active
            && self.valid_from.is_none_or(|from| now >= from)
            && self.valid_until.is_none_or(|until| now <= until)
    }

    pub fn matches(&self, vehicle_class: VehicleClass, spot_size: SpotSize) -> bool {
        (self.vehicle_classes.is_empty() || self.vehicle_classes.contains(&vehicle_class))
            && (self.spot_sizes.is_empty() || self.spot_sizes.contains(&spot_size))
    }
}

/// Source of a facility's pricing rules.
pub trait RuleRepository {
    fn rules_for_facility(&self, facility_id: Ulid) -> Vec<PricingRule>;
}

impl RuleRepository for [PricingRule] {
    fn rules_for_facility(&self, facility_id: Ulid) -> Vec<PricingRule> {
        self.iter()
            .filter(|r| r.facility_id == facility_id)
            .cloned()
            .collect()
    }
}

/// Highest-priority active rule matching the filters at `now`; ties go to the
/// earliest-created rule.
pub fn select_rule<R: RuleRepository + ?Sized>(
    repo: &R,
    facility_id: Ulid,
    vehicle_class: VehicleClass,
    spot_size: SpotSize,
    now: Ms,
) -> Option<PricingRule> {
    repo.rules_for_facility(facility_id)
        .into_iter()
        .filter(|r| r.is_valid_at(now) && r.matches(vehicle_class, spot_size))
        .min_by_key(|r| (Reverse(r.priority), r.created_at, r.id))
}
