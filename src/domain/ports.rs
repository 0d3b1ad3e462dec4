//! Port traits for the crate's external collaborators. Oracle and Exchange
//! are out of scope for production implementation (per the core's purpose
//! statement) — only their contracts live here, plus mock doubles for
//! tests, grounded on the teacher's `Mode::Mock` / `TestMarketDataService`
//! pattern.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::account::AccountState;
use crate::domain::errors::{ExchangeError, OracleError};
use crate::domain::plan::StrategyPlanCard;
use crate::domain::regime::RegimeClassification;
use crate::domain::signals::{Candle, RegimeSignals};

#[derive(Debug, Clone)]
pub struct OracleRegimeResult {
    pub classification: RegimeClassification,
    pub cost_usd: Decimal,
    pub tokens: u64,
}

#[derive(Debug, Clone)]
pub enum PlanProposal {
    NoChange,
    Change {
        new_plan: StrategyPlanCard,
        expected_advantage_bps: Decimal,
    },
}

/// The LLM-backed decision interface: regime classification and plan
/// proposals. Strict JSON schemas at the edge; the core retries once on
/// schema violation, then treats the call as failed.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn classify_regime(&self, signals: &RegimeSignals) -> Result<OracleRegimeResult, OracleError>;

    async fn propose_plan(
        &self,
        state: &AccountState,
        signals: &RegimeSignals,
        regime: &RegimeClassification,
    ) -> Result<PlanProposal, OracleError>;
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub coin: String,
    pub is_buy: bool,
    pub size: Decimal,
    pub limit_px: Option<Decimal>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: String,
    pub filled_size: Decimal,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub usdc_amount: Decimal,
    pub to_perp: bool,
}

/// L2 order-book summary, as returned by the venue's `l2_snapshot(coin)`.
#[derive(Debug, Clone, Copy)]
pub struct L2Snapshot {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub depth: Decimal,
}

impl L2Snapshot {
    pub fn spread_bps(&self) -> Decimal {
        if self.best_bid.is_zero() {
            return Decimal::ZERO;
        }
        let mid = (self.best_bid + self.best_ask) / Decimal::TWO;
        if mid.is_zero() {
            return Decimal::ZERO;
        }
        (self.best_ask - self.best_bid) / mid * Decimal::from(10_000)
    }
}

/// Venue API surface. Semantics follow the venue's own published API; this
/// trait does not reinterpret them, only names the operations the core
/// needs.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn user_state(&self) -> Result<AccountState, ExchangeError>;
    async fn spot_balances(&self) -> Result<HashMap<String, Decimal>, ExchangeError>;
    async fn mid_price(&self, coin: &str) -> Result<Decimal, ExchangeError>;
    async fn l2_snapshot(&self, coin: &str) -> Result<L2Snapshot, ExchangeError>;
    async fn open_interest(&self, coin: &str) -> Result<Decimal, ExchangeError>;
    async fn candles_snapshot(
        &self,
        coin: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ExchangeError>;
    async fn funding_history(
        &self,
        coin: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Decimal>, ExchangeError>;
    async fn order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError>;
    async fn transfer(&self, request: TransferRequest) -> Result<(), ExchangeError>;
}
