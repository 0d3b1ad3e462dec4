//! Venue-sourced provider tasks: order book, funding, candles, open
//! interest and mid price, all read through the `Exchange` port and
//! wrapped in the shared circuit breaker + retry machinery. Grounded on
//! the teacher's `reqwest` + `reqwest-middleware` retry stack,
//! generalized here to any `Exchange` call rather than only HTTP.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::application::orchestrator::{FetchedField, FieldName, FieldValue, ProviderTask};
use crate::application::providers::{fetch_with_retry, CircuitBreaker};
use crate::domain::errors::{ExchangeError, ProviderError};
use crate::domain::ports::Exchange;

const VENUE_SOURCE: &str = "hyperliquid";

/// Read-only calls never actually reject an order/transfer; the match
/// stays exhaustive for when the trait grows new variants.
fn classify(err: ExchangeError) -> ProviderError {
    match err {
        ExchangeError::CallFailed(_) => ProviderError::ServerError { source: VENUE_SOURCE.into(), status: 0 },
        ExchangeError::OrderRejected(_) | ExchangeError::TransferRejected(_) => {
            ProviderError::ClientError { source: VENUE_SOURCE.into(), status: 0 }
        }
    }
}

pub fn mid_price_task(exchange: Arc<dyn Exchange>, breaker: Arc<CircuitBreaker>, coin: String, backoff_base: f64) -> ProviderTask {
    let source = VENUE_SOURCE.to_string();
    ProviderTask {
        field: FieldName::MidPrice,
        source: source.clone(),
        future: Box::pin(async move {
            let value = fetch_with_retry(&breaker, backoff_base, || {
                let exchange = exchange.clone();
                let coin = coin.clone();
                async move { exchange.mid_price(&coin).await.map_err(classify) }
            })
            .await?;
            Ok(FetchedField { value: FieldValue::Decimal(value), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    }
}

pub fn l2_tasks(exchange: Arc<dyn Exchange>, breaker: Arc<CircuitBreaker>, coin: String, backoff_base: f64) -> (ProviderTask, ProviderTask) {
    let depth = {
        let exchange = exchange.clone();
        let breaker = breaker.clone();
        let coin = coin.clone();
        ProviderTask {
            field: FieldName::OrderBookDepth,
            source: VENUE_SOURCE.to_string(),
            future: Box::pin(async move {
                let snapshot = fetch_with_retry(&breaker, backoff_base, || {
                    let exchange = exchange.clone();
                    let coin = coin.clone();
                    async move { exchange.l2_snapshot(&coin).await.map_err(classify) }
                })
                .await?;
                Ok(FetchedField { value: FieldValue::Decimal(snapshot.depth), confidence: 1.0, is_cached: false, cache_age_seconds: None })
            }),
        }
    };
    let spread = ProviderTask {
        field: FieldName::BidAskSpreadBps,
        source: VENUE_SOURCE.to_string(),
        future: Box::pin(async move {
            let snapshot = fetch_with_retry(&breaker, backoff_base, || {
                let exchange = exchange.clone();
                let coin = coin.clone();
                async move { exchange.l2_snapshot(&coin).await.map_err(classify) }
            })
            .await?;
            Ok(FetchedField { value: FieldValue::Decimal(snapshot.spread_bps()), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    };
    (depth, spread)
}

pub fn open_interest_task(exchange: Arc<dyn Exchange>, breaker: Arc<CircuitBreaker>, coin: String, backoff_base: f64) -> ProviderTask {
    ProviderTask {
        field: FieldName::OpenInterest,
        source: VENUE_SOURCE.to_string(),
        future: Box::pin(async move {
            let value = fetch_with_retry(&breaker, backoff_base, || {
                let exchange = exchange.clone();
                let coin = coin.clone();
                async move { exchange.open_interest(&coin).await.map_err(classify) }
            })
            .await?;
            Ok(FetchedField { value: FieldValue::Decimal(value), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    }
}

pub fn candles_task(
    exchange: Arc<dyn Exchange>,
    breaker: Arc<CircuitBreaker>,
    coin: String,
    interval: String,
    lookback: chrono::Duration,
    backoff_base: f64,
) -> ProviderTask {
    ProviderTask {
        field: FieldName::Candles,
        source: VENUE_SOURCE.to_string(),
        future: Box::pin(async move {
            let end = Utc::now();
            let start = end - lookback;
            let candles = fetch_with_retry(&breaker, backoff_base, || {
                let exchange = exchange.clone();
                let coin = coin.clone();
                let interval = interval.clone();
                async move { exchange.candles_snapshot(&coin, &interval, start, end).await.map_err(classify) }
            })
            .await?;
            Ok(FetchedField { value: FieldValue::Candles(candles), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    }
}

pub fn funding_rate_task(
    exchange: Arc<dyn Exchange>,
    breaker: Arc<CircuitBreaker>,
    coin: String,
    lookback: chrono::Duration,
    backoff_base: f64,
) -> ProviderTask {
    ProviderTask {
        field: FieldName::FundingRate,
        source: VENUE_SOURCE.to_string(),
        future: Box::pin(async move {
            let end = Utc::now();
            let start = end - lookback;
            let history = fetch_with_retry(&breaker, backoff_base, || {
                let exchange = exchange.clone();
                let coin = coin.clone();
                async move { exchange.funding_history(&coin, start, end).await.map_err(classify) }
            })
            .await?;
            if history.is_empty() {
                return Err(ProviderError::ServerError { source: VENUE_SOURCE.into(), status: 0 });
            }
            let avg = history.iter().copied().sum::<Decimal>() / Decimal::from(history.len() as u64);
            Ok(FetchedField { value: FieldValue::Decimal(avg), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    }
}

/// Wraps a built task with a cache-first read: a fresh cache hit short
/// circuits the venue call entirely and returns a decayed-confidence
/// value instead (per `spec.md` §4.1's "cache is consulted before any
/// provider call" rule); a miss falls through to `task` and populates the
/// cache with the result on success.
pub fn cache_wrapped(
    cache: Arc<dyn crate::application::cache::Cache>,
    cache_key: String,
    ttl_seconds: f64,
    task: ProviderTask,
) -> ProviderTask {
    ProviderTask {
        field: task.field,
        source: task.source,
        future: Box::pin(async move {
            if let Ok(Some(entry)) = cache.get(&cache_key).await {
                if let Ok(value) = serde_json::from_slice::<Decimal>(&entry.value) {
                    let confidence = crate::application::cache::decayed_confidence(entry.age_seconds, ttl_seconds);
                    return Ok(FetchedField {
                        value: FieldValue::Decimal(value),
                        confidence,
                        is_cached: true,
                        cache_age_seconds: Some(entry.age_seconds),
                    });
                }
            }
            let fetched = task.future.await?;
            if let FieldValue::Decimal(value) = &fetched.value {
                if let Ok(bytes) = serde_json::to_vec(value) {
                    let _ = cache.set(&cache_key, bytes, ttl_seconds).await;
                }
            }
            Ok(fetched)
        }),
    }
}
