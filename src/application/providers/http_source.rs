//! Third-party HTTP provider tasks: fear/greed index, token unlock
//! calendars, macro event calendars and cross-asset price histories.
//! Grounded on `infrastructure/http_client_factory.rs`'s pooled
//! `ClientWithMiddleware` for connection reuse; retry/circuit-breaking is
//! layered on top via [`fetch_with_retry`] rather than the middleware's
//! own retry policy, to get the exact backoff/jitter shape `spec.md` §4.2
//! specifies.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;

use crate::application::orchestrator::{FetchedField, FieldName, FieldValue, ProviderTask};
use crate::application::providers::{fetch_with_retry, CircuitBreaker};
use crate::domain::errors::ProviderError;
use crate::domain::signals::MacroEvent;

/// Builds the pooled client shared by every HTTP-backed provider.
/// Transient-error retries are disabled at the middleware layer (0 max
/// retries) since `fetch_with_retry` owns that concern; the middleware
/// client is kept only for connection pooling and timeouts.
pub fn build_http_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(0);
    let client = Client::builder()
        .pool_max_idle_per_host(5)
        .timeout(Duration::from_secs(10))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| Client::new());
    ClientBuilder::new(client).with(RetryTransientMiddleware::new_with_policy(retry_policy)).build()
}

fn classify_status(source: &str, status: reqwest::StatusCode) -> ProviderError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimitExceeded { source: source.to_string() }
    } else if status.is_server_error() {
        ProviderError::ServerError { source: source.to_string(), status: status.as_u16() }
    } else {
        ProviderError::ClientError { source: source.to_string(), status: status.as_u16() }
    }
}

async fn get_json<T: for<'de> Deserialize<'de>>(
    client: &ClientWithMiddleware,
    source: &str,
    url: &str,
) -> Result<T, ProviderError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|_| ProviderError::Timeout { source: source.to_string() })?;
    if !response.status().is_success() {
        return Err(classify_status(source, response.status()));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::SchemaViolation { source: source.to_string(), detail: e.to_string() })
}

#[derive(Debug, Deserialize)]
struct FearGreedResponse {
    value: f64,
}

pub fn fear_greed_task(client: ClientWithMiddleware, breaker: Arc<CircuitBreaker>, base_url: String, backoff_base: f64) -> ProviderTask {
    let source = "fear_greed".to_string();
    ProviderTask {
        field: FieldName::FearGreedIndex,
        source: source.clone(),
        future: Box::pin(async move {
            let url = format!("{base_url}/fear-greed");
            let value = fetch_with_retry(&breaker, backoff_base, || {
                let client = client.clone();
                let url = url.clone();
                let source = source.clone();
                async move { get_json::<FearGreedResponse>(&client, &source, &url).await.map(|r| r.value) }
            })
            .await?;
            Ok(FetchedField { value: FieldValue::F64(value), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    }
}

#[derive(Debug, Deserialize)]
struct TokenUnlockResponse {
    unlocks: Vec<String>,
}

pub fn token_unlocks_task(client: ClientWithMiddleware, breaker: Arc<CircuitBreaker>, base_url: String, coin: String, backoff_base: f64) -> ProviderTask {
    let source = "token_unlocks".to_string();
    ProviderTask {
        field: FieldName::TokenUnlocks,
        source: source.clone(),
        future: Box::pin(async move {
            let url = format!("{base_url}/unlocks/{coin}");
            let unlocks = fetch_with_retry(&breaker, backoff_base, || {
                let client = client.clone();
                let url = url.clone();
                let source = source.clone();
                async move { get_json::<TokenUnlockResponse>(&client, &source, &url).await.map(|r| r.unlocks) }
            })
            .await?;
            Ok(FetchedField { value: FieldValue::Unlocks(unlocks), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    }
}

#[derive(Debug, Deserialize)]
struct MacroCalendarEntry {
    name: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct MacroCalendarResponse {
    events: Vec<MacroCalendarEntry>,
}

pub fn macro_calendar_task(client: ClientWithMiddleware, breaker: Arc<CircuitBreaker>, base_url: String, backoff_base: f64) -> ProviderTask {
    let source = "macro_calendar".to_string();
    ProviderTask {
        field: FieldName::MacroCalendar,
        source: source.clone(),
        future: Box::pin(async move {
            let url = format!("{base_url}/calendar");
            let events = fetch_with_retry(&breaker, backoff_base, || {
                let client = client.clone();
                let url = url.clone();
                let source = source.clone();
                async move {
                    get_json::<MacroCalendarResponse>(&client, &source, &url)
                        .await
                        .map(|r| r.events.into_iter().map(|e| MacroEvent { name: e.name, timestamp: e.timestamp }).collect::<Vec<_>>())
                }
            })
            .await?;
            Ok(FetchedField { value: FieldValue::MacroEvents(events), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    }
}

#[derive(Debug, Deserialize)]
struct AssetHistoryResponse {
    prices: Vec<rust_decimal::Decimal>,
}

pub fn asset_price_histories_task(
    client: ClientWithMiddleware,
    breaker: Arc<CircuitBreaker>,
    base_url: String,
    coin: String,
    backoff_base: f64,
) -> ProviderTask {
    let source = "asset_price_histories".to_string();
    ProviderTask {
        field: FieldName::AssetPriceHistories,
        source: source.clone(),
        future: Box::pin(async move {
            let url = format!("{base_url}/prices/{coin}");
            let prices = fetch_with_retry(&breaker, backoff_base, || {
                let client = client.clone();
                let url = url.clone();
                let source = source.clone();
                async move { get_json::<AssetHistoryResponse>(&client, &source, &url).await.map(|r| r.prices) }
            })
            .await?;
            Ok(FetchedField { value: FieldValue::DecimalSeries(prices), confidence: 1.0, is_cached: false, cache_age_seconds: None })
        }),
    }
}
