//! Price calculation. Everything here is pure: rule + interval in, amount out.

mod rules;
mod strategy;
mod subscription;

pub use rules::{select_rule, PricingRule, RuleRepository};
pub use strategy::{
    DynamicConfig, FlatRateConfig, HourlyConfig, PeakWindow, Slab, SlabConfig, StrategyConfig,
    StrategyKind, SLAB_OVERFLOW_PRICE,
};
pub use subscription::{check_subscription, SubscriptionRepository};

use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::{Ms, HOUR_MS, MINUTE_MS};

/// Whole elapsed minutes, truncated; negative intervals count as zero.
pub fn elapsed_minutes(entry: Ms, exit: Ms) -> i64 {
    (exit - entry).max(0) / MINUTE_MS
}

fn minutes_to_hours(minutes: i64) -> Decimal {
    Decimal::from(minutes) / Decimal::from(60)
}

/// Base price of `[entry, exit)` under `rule`, after the free-minutes grace.
pub fn price(rule: &PricingRule, entry: Ms, exit: Ms) -> Decimal {
    let chargeable = (elapsed_minutes(entry, exit) - rule.free_minutes as i64).max(0);
    rule.config
        .price(minutes_to_hours(chargeable), entry)
        .round_dp(2)
}

/// Price when no rule applies: `rate` per started hour.
pub fn fallback_price(rate: Decimal, entry: Ms, exit: Ms) -> Decimal {
    (rate * minutes_to_hours(elapsed_minutes(entry, exit)).ceil()).round_dp(2)
}

/// Penalty for leaving after `grace_end`: the rule's rate per started hour.
pub fn overstay_penalty(rule: &PricingRule, grace_end: Ms, actual_exit: Ms) -> Decimal {
    if actual_exit <= grace_end || rule.overstay_penalty_rate.is_zero() {
        return Decimal::ZERO;
    }
    let over = Decimal::from(actual_exit - grace_end) / Decimal::from(HOUR_MS);
    (rule.overstay_penalty_rate * over.ceil()).round_dp(2)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedPricing {
    Subscription(Ulid),
    Rule { id: Ulid, name: String },
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    pub base_price: Decimal,
    pub penalties: Decimal,
    /// No discount source exists yet; always zero.
    pub discounts: Decimal,
    pub total: Decimal,
    pub duration_minutes: i64,
    pub applied: AppliedPricing,
}

impl PriceQuote {
    pub fn subscription(subscription_id: Ulid, entry: Ms, exit: Ms) -> Self {
        Self {
            base_price: Decimal::ZERO,
            penalties: Decimal::ZERO,
            discounts: Decimal::ZERO,
            total: Decimal::ZERO,
            duration_minutes: elapsed_minutes(entry, exit),
            applied: AppliedPricing::Subscription(subscription_id),
        }
    }

    pub fn from_rule(rule: Option<&PricingRule>, fallback_rate: Decimal, entry: Ms, exit: Ms) -> Self {
        let (base_price, applied) = match rule {
            Some(rule) => (
                price(rule, entry, exit),
                AppliedPricing::Rule {
                    id: rule.id,
                    name: rule.name.clone(),
                },
            ),
            None => (fallback_price(fallback_rate, entry, exit), AppliedPricing::Fallback),
        };
        Self {
            base_price,
            penalties: Decimal::ZERO,
            discounts: Decimal::ZERO,
            total: base_price,
            duration_minutes: elapsed_minutes(entry, exit),
            applied,
        }
    }

    /// Add the overstay penalty of `rule` when `exit` falls past `grace_end`.
    pub fn with_overstay(mut self, rule: Option<&PricingRule>, grace_end: Option<Ms>, exit: Ms) -> Self {
        if let (Some(rule), Some(grace_end)) = (rule, grace_end) {
            self.penalties = overstay_penalty(rule, grace_end, exit);
            self.total = self.base_price + self.penalties - self.discounts;
        }
        self
    }

    pub fn subscription_id(&self) -> Option<Ulid> {
        match self.applied {
            AppliedPricing::Subscription(id) => Some(id),
            _ => None,
        }
    }
}
