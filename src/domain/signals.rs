//! Signal types shared between providers, the orchestrator and the signal
//! processor. Every derived or fetched field carries a confidence and a
//! source tag; missing data is always explicit, never a silent zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Fast,
    Medium,
    Slow,
}

/// A single provider response, with confidence decay already applied if
/// served from cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub confidence: f64,
    pub is_cached: bool,
    pub cache_age_seconds: Option<f64>,
}

/// A field that may be missing; missing is `None(source, reason)` with
/// confidence forced to zero, never a defaulted value with full confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field<T> {
    Present { value: T, confidence: f64, source: String },
    Missing { source: String, reason: String },
}

impl<T> Field<T> {
    pub fn confidence(&self) -> f64 {
        match self {
            Field::Present { confidence, .. } => *confidence,
            Field::Missing { .. } => 0.0,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Present { value, .. } => Some(value),
            Field::Missing { .. } => None,
        }
    }

    pub fn missing(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Field::Missing { source: source.into(), reason: reason.into() }
    }

    pub fn present(value: T, confidence: f64, source: impl Into<String>) -> Self {
        Field::Present { value, confidence, source: source.into() }
    }
}

/// Metadata common to every bundle: overall confidence is the minimum of
/// the bundle's critical fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub kind: SignalKind,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Fan-out aggregate produced by the Orchestrator. Fields present depend on
/// `kind`; a field absent for the requested kind is simply not populated
/// (not represented as `Missing`, since it was never requested).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBundle {
    pub metadata: BundleMetadata,
    pub mid_price: Option<Field<Decimal>>,
    pub order_book_depth: Option<Field<Decimal>>,
    pub bid_ask_spread_bps: Option<Field<Decimal>>,
    pub funding_rate: Option<Field<Decimal>>,
    pub open_interest: Option<Field<Decimal>>,
    pub candles: Option<Field<Vec<Candle>>>,
    pub fear_greed_index: Option<Field<f64>>,
    pub token_unlocks: Option<Field<Vec<String>>>,
    pub macro_calendar: Option<Field<Vec<MacroEvent>>>,
    pub asset_price_histories: Option<Field<Vec<Decimal>>>,
}

impl SignalBundle {
    /// A bundle with no successful fields, used when every provider failed
    /// or the deadline elapsed before anything returned.
    pub fn fallback(kind: SignalKind, now: DateTime<Utc>) -> Self {
        SignalBundle {
            metadata: BundleMetadata { kind, confidence: 0.0, timestamp: now },
            mid_price: None,
            order_book_depth: None,
            bid_ask_spread_bps: None,
            funding_rate: None,
            open_interest: None,
            candles: None,
            fear_greed_index: None,
            token_unlocks: None,
            macro_calendar: None,
            asset_price_histories: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// Inputs to regime classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeSignals {
    pub return_1d: Option<f64>,
    pub return_7d: Option<f64>,
    pub return_30d: Option<f64>,
    pub return_90d: Option<f64>,
    pub sma20_distance_pct: Option<f64>,
    pub sma50_distance_pct: Option<f64>,
    pub higher_high: Option<bool>,
    pub higher_low: Option<bool>,
    pub adx: Option<f64>,
    pub realized_vol_24h: Option<f64>,
    pub avg_funding_rate: Option<f64>,
    pub bid_ask_spread_bps: Option<f64>,
    pub order_book_depth: Option<f64>,
    pub cross_asset_correlation: Option<f64>,
    pub macro_risk_score: Option<f64>,
    pub sentiment_index: Option<f64>,
}
