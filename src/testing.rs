//! Test doubles for the two ports the governance core has no production
//! implementation of (`spec.md` §1 scopes the exchange/LLM integrations
//! out). Grounded on `application/monitor/mod.rs`'s `TestExchange` shape,
//! generalized to be configurable rather than hardcoded, so integration
//! tests can script specific scenarios.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::account::AccountState;
use crate::domain::errors::{ExchangeError, OracleError};
use crate::domain::ports::{Exchange, L2Snapshot, OracleRegimeResult, OrderRequest, OrderResult, PlanProposal, Oracle, TransferRequest};
use crate::domain::regime::RegimeClassification;
use crate::domain::signals::{Candle, RegimeSignals};

/// An exchange double whose every response is pre-scripted. `user_state`
/// fails when `fail_user_state` is set, mirroring the monitor's
/// stale-fallback test; everything else returns a fixed value unless
/// overridden via the `*_override` fields.
pub struct MockExchange {
    pub fail_user_state: AtomicBool,
    pub account_state: Mutex<AccountState>,
    pub spot_balances: Mutex<HashMap<String, Decimal>>,
    pub mid_prices: Mutex<HashMap<String, Decimal>>,
    pub default_mid_price: Decimal,
    pub order_calls: AtomicU64,
    pub reject_orders: AtomicBool,
}

impl MockExchange {
    pub fn new(account_state: AccountState) -> Self {
        MockExchange {
            fail_user_state: AtomicBool::new(false),
            account_state: Mutex::new(account_state),
            spot_balances: Mutex::new(HashMap::new()),
            mid_prices: Mutex::new(HashMap::new()),
            default_mid_price: Decimal::ONE,
            order_calls: AtomicU64::new(0),
            reject_orders: AtomicBool::new(false),
        }
    }

    pub fn set_mid_price(&self, coin: &str, price: Decimal) {
        self.mid_prices.lock().expect("mock exchange lock poisoned").insert(coin.to_string(), price);
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn user_state(&self) -> Result<AccountState, ExchangeError> {
        if self.fail_user_state.load(Ordering::Relaxed) {
            return Err(ExchangeError::CallFailed("mock exchange: user_state unavailable".into()));
        }
        Ok(self.account_state.lock().expect("mock exchange lock poisoned").clone())
    }

    async fn spot_balances(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        Ok(self.spot_balances.lock().expect("mock exchange lock poisoned").clone())
    }

    async fn mid_price(&self, coin: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.mid_prices.lock().expect("mock exchange lock poisoned").get(coin).copied().unwrap_or(self.default_mid_price))
    }

    async fn l2_snapshot(&self, _coin: &str) -> Result<L2Snapshot, ExchangeError> {
        Ok(L2Snapshot { best_bid: self.default_mid_price, best_ask: self.default_mid_price, depth: Decimal::ZERO })
    }

    async fn open_interest(&self, _coin: &str) -> Result<Decimal, ExchangeError> {
        Ok(Decimal::ZERO)
    }

    async fn candles_snapshot(&self, _coin: &str, _interval: &str, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<Candle>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn funding_history(&self, _coin: &str, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<Vec<Decimal>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError> {
        self.order_calls.fetch_add(1, Ordering::Relaxed);
        if self.reject_orders.load(Ordering::Relaxed) {
            return Err(ExchangeError::OrderRejected("mock exchange: orders rejected for this test".into()));
        }
        Ok(OrderResult { order_id: format!("mock-{}", self.order_calls.load(Ordering::Relaxed)), filled_size: request.size })
    }

    async fn transfer(&self, _request: TransferRequest) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// An oracle double returning pre-scripted classifications and proposals.
/// `propose_plan` defaults to `NoChange` unless a plan has been queued via
/// `queue_proposal`.
pub struct MockOracle {
    pub classification: Mutex<RegimeClassification>,
    pub proposal: Mutex<Option<PlanProposal>>,
    pub fail_classify: AtomicBool,
    pub fail_propose: AtomicBool,
}

impl MockOracle {
    pub fn new(classification: RegimeClassification) -> Self {
        MockOracle { classification: Mutex::new(classification), proposal: Mutex::new(None), fail_classify: AtomicBool::new(false), fail_propose: AtomicBool::new(false) }
    }

    pub fn queue_proposal(&self, proposal: PlanProposal) {
        *self.proposal.lock().expect("mock oracle lock poisoned") = Some(proposal);
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn classify_regime(&self, _signals: &RegimeSignals) -> Result<OracleRegimeResult, OracleError> {
        if self.fail_classify.load(Ordering::Relaxed) {
            return Err(OracleError::CallFailed("mock oracle: classify_regime unavailable".into()));
        }
        let classification = self.classification.lock().expect("mock oracle lock poisoned").clone();
        Ok(OracleRegimeResult { classification, cost_usd: Decimal::ZERO, tokens: 0 })
    }

    async fn propose_plan(&self, _state: &AccountState, _signals: &RegimeSignals, _regime: &RegimeClassification) -> Result<PlanProposal, OracleError> {
        if self.fail_propose.load(Ordering::Relaxed) {
            return Err(OracleError::CallFailed("mock oracle: propose_plan unavailable".into()));
        }
        Ok(self.proposal.lock().expect("mock oracle lock poisoned").take().unwrap_or(PlanProposal::NoChange))
    }
}
