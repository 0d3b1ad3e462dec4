//! Fan-out orchestrator (C3). Grounded on the teacher's parallel
//! collection shape in `application/market_data` and its
//! `futures::future::join_all`-based concurrent dispatch; deadline
//! enforcement mirrors `application/monitoring/heartbeat.rs`'s
//! `Duration`-based thresholds via `tokio::time::timeout` per provider
//! future.

use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;

use crate::domain::errors::ProviderError;
use crate::domain::signals::{Candle, Field, MacroEvent, SignalBundle, SignalKind};

#[derive(Debug, Clone)]
pub enum FieldValue {
    Decimal(Decimal),
    F64(f64),
    Candles(Vec<Candle>),
    Unlocks(Vec<String>),
    MacroEvents(Vec<MacroEvent>),
    DecimalSeries(Vec<Decimal>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldName {
    MidPrice,
    OrderBookDepth,
    BidAskSpreadBps,
    FundingRate,
    OpenInterest,
    Candles,
    FearGreedIndex,
    TokenUnlocks,
    MacroCalendar,
    AssetPriceHistories,
}

pub struct FetchedField {
    pub value: FieldValue,
    pub confidence: f64,
    pub is_cached: bool,
    pub cache_age_seconds: Option<f64>,
}

pub struct ProviderTask {
    pub field: FieldName,
    pub source: String,
    pub future: Pin<Box<dyn std::future::Future<Output = Result<FetchedField, ProviderError>> + Send>>,
}

pub struct SignalRequest {
    pub kind: SignalKind,
    pub deadline: Duration,
}

fn deadline_for(kind: SignalKind) -> Duration {
    match kind {
        SignalKind::Fast => Duration::from_secs(5),
        SignalKind::Medium => Duration::from_secs(15),
        SignalKind::Slow => Duration::from_secs(30),
    }
}

impl SignalRequest {
    pub fn new(kind: SignalKind) -> Self {
        SignalRequest { kind, deadline: deadline_for(kind) }
    }

    pub fn with_deadline(kind: SignalKind, deadline: Duration) -> Self {
        SignalRequest { kind, deadline }
    }
}

/// Runs every task in parallel bounded by the request's deadline. A
/// provider still pending at the deadline, or one that failed, contributes
/// an explicit missing field rather than failing the whole bundle. If zero
/// fields returned a value, the bundle's `metadata.confidence` is 0.
pub async fn collect(request: SignalRequest, tasks: Vec<ProviderTask>) -> SignalBundle {
    let now = Utc::now();
    let mut bundle = SignalBundle::fallback(request.kind, now);
    if tasks.is_empty() {
        return bundle;
    }

    let deadline = request.deadline;
    let sources: Vec<String> = tasks.iter().map(|t| t.source.clone()).collect();
    let fields: Vec<FieldName> = tasks.iter().map(|t| t.field).collect();
    let futures_by_task = tasks.into_iter().map(|t| tokio::time::timeout(deadline, t.future));
    let results = join_all(futures_by_task).await;

    let mut any_success = false;
    let mut min_confidence = 1.0f64;

    for ((field, source), outcome) in fields.into_iter().zip(sources).zip(results) {
        match outcome {
            Ok(Ok(fetched)) => {
                any_success = true;
                min_confidence = min_confidence.min(fetched.confidence);
                apply_field(&mut bundle, field, fetched, &source);
            }
            Ok(Err(_provider_err)) => {
                apply_missing(&mut bundle, field, &source, "provider error".to_string());
                min_confidence = 0.0;
            }
            Err(_elapsed) => {
                apply_missing(&mut bundle, field, &source, "deadline exceeded".to_string());
                min_confidence = 0.0;
            }
        }
    }

    bundle.metadata.confidence = if any_success { min_confidence } else { 0.0 };
    bundle
}

fn apply_field(bundle: &mut SignalBundle, field: FieldName, fetched: FetchedField, source: &str) {
    let confidence = fetched.confidence;
    match (field, fetched.value) {
        (FieldName::MidPrice, FieldValue::Decimal(v)) => {
            bundle.mid_price = Some(Field::present(v, confidence, source))
        }
        (FieldName::OrderBookDepth, FieldValue::Decimal(v)) => {
            bundle.order_book_depth = Some(Field::present(v, confidence, source))
        }
        (FieldName::BidAskSpreadBps, FieldValue::Decimal(v)) => {
            bundle.bid_ask_spread_bps = Some(Field::present(v, confidence, source))
        }
        (FieldName::FundingRate, FieldValue::Decimal(v)) => {
            bundle.funding_rate = Some(Field::present(v, confidence, source))
        }
        (FieldName::OpenInterest, FieldValue::Decimal(v)) => {
            bundle.open_interest = Some(Field::present(v, confidence, source))
        }
        (FieldName::Candles, FieldValue::Candles(v)) => {
            bundle.candles = Some(Field::present(v, confidence, source))
        }
        (FieldName::FearGreedIndex, FieldValue::F64(v)) => {
            bundle.fear_greed_index = Some(Field::present(v, confidence, source))
        }
        (FieldName::TokenUnlocks, FieldValue::Unlocks(v)) => {
            bundle.token_unlocks = Some(Field::present(v, confidence, source))
        }
        (FieldName::MacroCalendar, FieldValue::MacroEvents(v)) => {
            bundle.macro_calendar = Some(Field::present(v, confidence, source))
        }
        (FieldName::AssetPriceHistories, FieldValue::DecimalSeries(v)) => {
            bundle.asset_price_histories = Some(Field::present(v, confidence, source))
        }
        _ => {
            tracing::error!(field = ?field, "provider returned mismatched field value type");
        }
    }
}

fn apply_missing(bundle: &mut SignalBundle, field: FieldName, source: &str, reason: String) {
    let missing = || Field::missing(source, reason.clone());
    match field {
        FieldName::MidPrice => bundle.mid_price = Some(missing()),
        FieldName::OrderBookDepth => bundle.order_book_depth = Some(missing()),
        FieldName::BidAskSpreadBps => bundle.bid_ask_spread_bps = Some(missing()),
        FieldName::FundingRate => bundle.funding_rate = Some(missing()),
        FieldName::OpenInterest => bundle.open_interest = Some(missing()),
        FieldName::Candles => bundle.candles = Some(missing()),
        FieldName::FearGreedIndex => bundle.fear_greed_index = Some(missing()),
        FieldName::TokenUnlocks => bundle.token_unlocks = Some(missing()),
        FieldName::MacroCalendar => bundle.macro_calendar = Some(missing()),
        FieldName::AssetPriceHistories => bundle.asset_price_histories = Some(missing()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ok_task(field: FieldName, source: &str, value: Decimal) -> ProviderTask {
        ProviderTask {
            field,
            source: source.to_string(),
            future: Box::pin(async move {
                Ok(FetchedField { value: FieldValue::Decimal(value), confidence: 1.0, is_cached: false, cache_age_seconds: None })
            }),
        }
    }

    fn failing_task(field: FieldName, source: &str) -> ProviderTask {
        ProviderTask {
            field,
            source: source.to_string(),
            future: Box::pin(async { Err(ProviderError::Timeout { source: "x".into() }) }),
        }
    }

    #[tokio::test]
    async fn partial_failure_never_fails_whole_bundle() {
        let tasks = vec![
            ok_task(FieldName::MidPrice, "venue", dec!(100)),
            failing_task(FieldName::FundingRate, "venue"),
        ];
        let bundle = collect(SignalRequest::new(crate::domain::signals::SignalKind::Fast), tasks).await;
        assert!(bundle.mid_price.unwrap().value().is_some());
        assert_eq!(bundle.funding_rate.unwrap().confidence(), 0.0);
    }

    #[tokio::test]
    async fn all_missing_yields_zero_confidence_fallback() {
        let tasks = vec![failing_task(FieldName::MidPrice, "venue")];
        let bundle = collect(SignalRequest::new(crate::domain::signals::SignalKind::Fast), tasks).await;
        assert_eq!(bundle.metadata.confidence, 0.0);
    }

    #[tokio::test]
    async fn slow_provider_is_abandoned_at_deadline() {
        let task = ProviderTask {
            field: FieldName::MidPrice,
            source: "venue".into(),
            future: Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(FetchedField { value: FieldValue::Decimal(dec!(1)), confidence: 1.0, is_cached: false, cache_age_seconds: None })
            }),
        };
        let request = SignalRequest::with_deadline(crate::domain::signals::SignalKind::Fast, Duration::from_millis(5));
        let bundle = collect(request, vec![task]).await;
        assert!(bundle.mid_price.unwrap().value().is_none());
    }
}
