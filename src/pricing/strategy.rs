use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::Ms;

/// Price charged when chargeable hours exceed every bounded slab tier.
pub const SLAB_OVERFLOW_PRICE: Decimal = Decimal::TEN;

/// Strategy tag as stored by the rule catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    FlatRate,
    Hourly,
    Slab,
    Dynamic,
    Subscription,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::FlatRate => "FLAT_RATE",
            StrategyKind::Hourly => "HOURLY",
            StrategyKind::Slab => "SLAB",
            StrategyKind::Dynamic => "DYNAMIC",
            StrategyKind::Subscription => "SUBSCRIPTION",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FLAT_RATE" => Ok(StrategyKind::FlatRate),
            "HOURLY" => Ok(StrategyKind::Hourly),
            "SLAB" => Ok(StrategyKind::Slab),
            "DYNAMIC" => Ok(StrategyKind::Dynamic),
            "SUBSCRIPTION" => Ok(StrategyKind::Subscription),
            other => Err(EngineError::InvalidConfig(format!("unknown strategy: {other}"))),
        }
    }
}

// ── Per-strategy configuration ───────────────────────────────────
//
// The typed configs below are what the WAL stores: plain `Decimal` fields in
// their string form. Catalog documents are parsed through the `Raw*` shapes,
// which accept JSON numbers or numeric strings and fill in defaults.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRateConfig {
    pub flat_rate: Decimal,
}

/// `base_rate` per hour up to `after_hours`, then `hourly_rate` per extra hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyConfig {
    pub base_rate: Decimal,
    pub after_hours: u32,
    pub hourly_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slab {
    /// `None` = unbounded.
    pub max_hours: Option<Decimal>,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabConfig {
    pub slabs: Vec<Slab>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakWindow {
    pub days: Vec<Weekday>,
    /// Inclusive.
    pub start_hour: u32,
    /// Exclusive.
    pub end_hour: u32,
    pub rate: Decimal,
}

impl PeakWindow {
    fn contains(&self, day: Weekday, hour: u32) -> bool {
        self.days.contains(&day) && self.start_hour <= hour && hour < self.end_hour
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub peak_hours: Vec<PeakWindow>,
    pub off_peak_rate: Decimal,
    /// Facility wall-clock offset used to derive the entry weekday and hour.
    pub utc_offset_minutes: i32,
}

impl DynamicConfig {
    fn local_day_hour(&self, at: Ms) -> Option<(Weekday, u32)> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)?;
        let local = DateTime::<Utc>::from_timestamp_millis(at)?.with_timezone(&offset);
        Some((local.weekday(), local.hour()))
    }

    /// Rate in force at `entry`: first matching peak window, else off-peak.
    pub fn rate_at(&self, entry: Ms) -> Decimal {
        let Some((day, hour)) = self.local_day_hour(entry) else {
            return self.off_peak_rate;
        };
        self.peak_hours
            .iter()
            .find(|w| w.contains(day, hour))
            .map_or(self.off_peak_rate, |w| w.rate)
    }
}

// ── Catalog document shapes ──────────────────────────────────────

/// An amount as authored: `10`, `2.5` or `"2.50"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(serde_json::Number),
    Text(String),
}

impl RawAmount {
    fn to_decimal(&self, field: &str) -> Result<Decimal, EngineError> {
        let text = match self {
            RawAmount::Number(n) => n.to_string(),
            RawAmount::Text(s) => s.trim().to_string(),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|_| EngineError::InvalidConfig(format!("{field}: not an amount: {text:?}")))
    }
}

fn amount_or(raw: Option<RawAmount>, field: &str, default: Decimal) -> Result<Decimal, EngineError> {
    raw.map_or(Ok(default), |a| a.to_decimal(field))
}

#[derive(Deserialize)]
struct RawFlatRateConfig {
    flat_rate: Option<RawAmount>,
}

impl TryFrom<RawFlatRateConfig> for FlatRateConfig {
    type Error = EngineError;

    fn try_from(raw: RawFlatRateConfig) -> Result<Self, Self::Error> {
        Ok(FlatRateConfig {
            flat_rate: amount_or(raw.flat_rate, "flat_rate", Decimal::TEN)?,
        })
    }
}

#[derive(Deserialize)]
struct RawHourlyConfig {
    base_rate: Option<RawAmount>,
    after_hours: Option<u32>,
    hourly_rate: Option<RawAmount>,
}

impl TryFrom<RawHourlyConfig> for HourlyConfig {
    type Error = EngineError;

    fn try_from(raw: RawHourlyConfig) -> Result<Self, Self::Error> {
        Ok(HourlyConfig {
            base_rate: amount_or(raw.base_rate, "base_rate", Decimal::new(5, 0))?,
            after_hours: raw.after_hours.unwrap_or(1),
            hourly_rate: amount_or(raw.hourly_rate, "hourly_rate", Decimal::new(3, 0))?,
        })
    }
}

#[derive(Deserialize)]
struct RawSlab {
    max_hours: Option<RawAmount>,
    price: Option<RawAmount>,
}

#[derive(Deserialize)]
struct RawSlabConfig {
    #[serde(default)]
    slabs: Vec<RawSlab>,
}

impl TryFrom<RawSlabConfig> for SlabConfig {
    type Error = EngineError;

    fn try_from(raw: RawSlabConfig) -> Result<Self, Self::Error> {
        let slabs = raw
            .slabs
            .into_iter()
            .map(|s| -> Result<Slab, EngineError> {
                Ok(Slab {
                    max_hours: s.max_hours.map(|m| m.to_decimal("max_hours")).transpose()?,
                    price: amount_or(s.price, "slab price", Decimal::ZERO)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SlabConfig { slabs })
    }
}

// {"peak_hours":[{"days":["monday"],"start":"08:00","end":"18:00","rate":8}],"off_peak_rate":4}

fn peak_start_default() -> String {
    "00:00".into()
}

fn peak_end_default() -> String {
    "23:59".into()
}

#[derive(Deserialize)]
struct RawPeakWindow {
    #[serde(default)]
    days: Vec<String>,
    #[serde(default = "peak_start_default")]
    start: String,
    #[serde(default = "peak_end_default")]
    end: String,
    rate: Option<RawAmount>,
}

#[derive(Deserialize)]
struct RawDynamicConfig {
    #[serde(default)]
    peak_hours: Vec<RawPeakWindow>,
    off_peak_rate: Option<RawAmount>,
    #[serde(default)]
    utc_offset_minutes: i32,
}

fn parse_hour(clock: &str) -> Result<u32, EngineError> {
    let hour = clock
        .split(':')
        .next()
        .and_then(|h| h.trim().parse::<u32>().ok())
        .ok_or_else(|| EngineError::InvalidConfig(format!("bad clock time: {clock:?}")))?;
    if hour > 24 {
        return Err(EngineError::InvalidConfig(format!("hour out of range: {clock:?}")));
    }
    Ok(hour)
}

impl TryFrom<RawDynamicConfig> for DynamicConfig {
    type Error = EngineError;

    fn try_from(raw: RawDynamicConfig) -> Result<Self, Self::Error> {
        let mut peak_hours = Vec::with_capacity(raw.peak_hours.len());
        for w in raw.peak_hours {
            let days = w
                .days
                .iter()
                .map(|d| {
                    d.parse::<Weekday>()
                        .map_err(|_| EngineError::InvalidConfig(format!("unknown day: {d:?}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            peak_hours.push(PeakWindow {
                days,
                start_hour: parse_hour(&w.start)?,
                end_hour: parse_hour(&w.end)?,
                rate: amount_or(w.rate, "peak rate", Decimal::new(8, 0))?,
            });
        }
        Ok(DynamicConfig {
            peak_hours,
            off_peak_rate: amount_or(raw.off_peak_rate, "off_peak_rate", Decimal::new(5, 0))?,
            utc_offset_minutes: raw.utc_offset_minutes,
        })
    }
}

// ── Tagged strategy ──────────────────────────────────────────────

/// One validated configuration per pricing strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyConfig {
    FlatRate(FlatRateConfig),
    Hourly(HourlyConfig),
    Slab(SlabConfig),
    Dynamic(DynamicConfig),
    /// Marker for pass-only rules; the subscription gate prices these.
    Subscription,
}

fn parse_json<T: DeserializeOwned>(kind: StrategyKind, value: &serde_json::Value) -> Result<T, EngineError> {
    serde_json::from_value(value.clone())
        .map_err(|e| EngineError::InvalidConfig(format!("{kind}: {e}")))
}

fn non_negative(what: &str, v: Decimal) -> Result<(), EngineError> {
    if v.is_sign_negative() && !v.is_zero() {
        return Err(EngineError::InvalidConfig(format!("{what} must not be negative")));
    }
    Ok(())
}

impl StrategyConfig {
    /// Parse and validate a catalog configuration document once, at load time.
    pub fn from_json(kind: StrategyKind, value: &serde_json::Value) -> Result<Self, EngineError> {
        let config = match kind {
            StrategyKind::FlatRate => {
                StrategyConfig::FlatRate(parse_json::<RawFlatRateConfig>(kind, value)?.try_into()?)
            }
            StrategyKind::Hourly => {
                StrategyConfig::Hourly(parse_json::<RawHourlyConfig>(kind, value)?.try_into()?)
            }
            StrategyKind::Slab => StrategyConfig::Slab(parse_json::<RawSlabConfig>(kind, value)?.try_into()?),
            StrategyKind::Dynamic => {
                StrategyConfig::Dynamic(parse_json::<RawDynamicConfig>(kind, value)?.try_into()?)
            }
            StrategyKind::Subscription => StrategyConfig::Subscription,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategyConfig::FlatRate(_) => StrategyKind::FlatRate,
            StrategyConfig::Hourly(_) => StrategyKind::Hourly,
            StrategyConfig::Slab(_) => StrategyKind::Slab,
            StrategyConfig::Dynamic(_) => StrategyKind::Dynamic,
            StrategyConfig::Subscription => StrategyKind::Subscription,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            StrategyConfig::FlatRate(c) => non_negative("flat_rate", c.flat_rate),
            StrategyConfig::Hourly(c) => {
                non_negative("base_rate", c.base_rate)?;
                non_negative("hourly_rate", c.hourly_rate)
            }
            StrategyConfig::Slab(c) => {
                if c.slabs.is_empty() {
                    return Err(EngineError::InvalidConfig("slab rule needs at least one tier".into()));
                }
                if c.slabs.len() > MAX_SLAB_TIERS {
                    return Err(EngineError::LimitExceeded("too many slab tiers"));
                }
                let mut prev: Option<Decimal> = None;
                for (i, slab) in c.slabs.iter().enumerate() {
                    non_negative("slab price", slab.price)?;
                    match slab.max_hours {
                        Some(max) => {
                            if prev.is_some_and(|p| max <= p) {
                                return Err(EngineError::InvalidConfig(
                                    "slab tiers must be in ascending max_hours order".into(),
                                ));
                            }
                            prev = Some(max);
                        }
                        None if i + 1 != c.slabs.len() => {
                            return Err(EngineError::InvalidConfig(
                                "unbounded slab tier must be last".into(),
                            ));
                        }
                        None => {}
                    }
                }
                Ok(())
            }
            StrategyConfig::Dynamic(c) => {
                if c.peak_hours.len() > MAX_PEAK_WINDOWS {
                    return Err(EngineError::LimitExceeded("too many peak windows"));
                }
                if c.utc_offset_minutes.abs() > 14 * 60 {
                    return Err(EngineError::InvalidConfig("utc offset out of range".into()));
                }
                non_negative("off_peak_rate", c.off_peak_rate)?;
                for w in &c.peak_hours {
                    non_negative("peak rate", w.rate)?;
                    if w.start_hour >= w.end_hour {
                        return Err(EngineError::InvalidConfig(format!(
                            "peak window {}..{} is empty",
                            w.start_hour, w.end_hour
                        )));
                    }
                }
                Ok(())
            }
            StrategyConfig::Subscription => Ok(()),
        }
    }

    /// Base price for `hours` of chargeable time starting at `entry`.
    pub fn price(&self, hours: Decimal, entry: Ms) -> Decimal {
        match self {
            StrategyConfig::FlatRate(c) => c.flat_rate,
            StrategyConfig::Hourly(c) => {
                let after = Decimal::from(c.after_hours);
                if hours <= after {
                    c.base_rate * hours.ceil()
                } else {
                    c.base_rate * after + c.hourly_rate * (hours - after).ceil()
                }
            }
            StrategyConfig::Slab(c) => c
                .slabs
                .iter()
                .find(|s| s.max_hours.is_none_or(|max| hours <= max))
                .map_or(SLAB_OVERFLOW_PRICE, |s| s.price),
            StrategyConfig::Dynamic(c) => c.rate_at(entry) * hours.ceil(),
            StrategyConfig::Subscription => Decimal::ZERO,
        }
    }
}
