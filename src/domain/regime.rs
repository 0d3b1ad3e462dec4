//! Regime classification value types. Separate from `domain::signals`
//! because classification is a judgement over signals, not a signal itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::signals::RegimeSignals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegimeKind {
    TrendingBull,
    TrendingBear,
    RangeBound,
    CarryFriendly,
    EventRisk,
    Unknown,
}

impl fmt::Display for RegimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegimeKind::TrendingBull => "trending-bull",
            RegimeKind::TrendingBear => "trending-bear",
            RegimeKind::RangeBound => "range-bound",
            RegimeKind::CarryFriendly => "carry-friendly",
            RegimeKind::EventRisk => "event-risk",
            RegimeKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeClassification {
    pub regime: RegimeKind,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub signals: RegimeSignals,
    pub reasoning: String,
}
