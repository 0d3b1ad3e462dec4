//! Executor (C10). Grounded on `application/risk_management/sizing_engine.rs`
//! for size computation and `application/executor.rs` for the
//! action-to-order translation shape, plus `original_source/funding.py::
//! FundingPlanner` for the cross-wallet transfer planner, preserved
//! verbatim in ordering (perp-refill phase first, then per-action
//! transfer processing).

use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::domain::account::{AccountState, MarketType, Position};
use crate::domain::errors::ExchangeError;
use crate::domain::plan::TargetAllocation;
use crate::domain::ports::{Exchange, OrderRequest, TransferRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Buy,
    Sell,
    Hold,
    Close,
    Transfer,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub coin: String,
    pub market_type: MarketType,
    pub size: Option<Decimal>,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

/// Pre-trade validation: action kind must be recognized, coin non-empty,
/// size present and positive except for `hold`, `close` requires a size.
pub fn validate_action(action: &Action) -> Result<(), String> {
    if action.coin.is_empty() && action.kind != ActionKind::Transfer {
        return Err("coin must not be empty".to_string());
    }
    match action.kind {
        ActionKind::Hold => Ok(()),
        ActionKind::Close => {
            if action.size.map(|s| s <= Decimal::ZERO).unwrap_or(true) {
                Err("close requires a positive size".to_string())
            } else {
                Ok(())
            }
        }
        ActionKind::Buy | ActionKind::Sell => {
            if action.size.map(|s| s <= Decimal::ZERO).unwrap_or(true) {
                Err("size must be > 0".to_string())
            } else {
                Ok(())
            }
        }
        ActionKind::Transfer => Ok(()),
    }
}

/// Per-`(coin, market_type)` size precision, as provided by the venue
/// registry. Rounding is **ROUND_DOWN** using decimal arithmetic to avoid
/// emitting a size exceeding venue precision.
pub fn round_size(size: Decimal, sz_decimals: u32) -> Decimal {
    size.round_dp_with_strategy(sz_decimals, RoundingStrategy::ToZero)
}

/// `price = None` => market order; otherwise limit at `price`. `close`
/// always uses a market order regardless of any supplied price.
pub fn to_order_request(coin: &str, is_buy: bool, size: Decimal, price: Option<Decimal>, is_close: bool) -> OrderRequest {
    OrderRequest {
        coin: coin.to_string(),
        is_buy,
        size,
        limit_px: if is_close { None } else { price },
        reduce_only: is_close,
    }
}

pub async fn execute(exchange: &Arc<dyn Exchange>, action: Action, sz_decimals: u32) -> ExecutionResult {
    if let Err(reason) = validate_action(&action) {
        return ExecutionResult { success: false, order_id: None, error: Some(reason) };
    }

    match action.kind {
        ActionKind::Hold => ExecutionResult { success: true, order_id: None, error: None },
        ActionKind::Buy | ActionKind::Sell | ActionKind::Close => {
            let raw_size = action.size.unwrap_or(Decimal::ZERO);
            let size = round_size(raw_size, sz_decimals);
            let is_buy = matches!(action.kind, ActionKind::Buy);
            let request = to_order_request(&action.coin, is_buy, size, action.price, action.kind == ActionKind::Close);
            match exchange.order(request).await {
                Ok(result) => ExecutionResult { success: true, order_id: Some(result.order_id), error: None },
                Err(ExchangeError::OrderRejected(reason)) | Err(ExchangeError::CallFailed(reason)) => {
                    ExecutionResult { success: false, order_id: None, error: Some(reason) }
                }
                Err(other) => ExecutionResult { success: false, order_id: None, error: Some(other.to_string()) },
            }
        }
        ActionKind::Transfer => {
            let amount = action.size.unwrap_or(Decimal::ZERO);
            match exchange.transfer(TransferRequest { usdc_amount: amount, to_perp: action.market_type == MarketType::Perp }).await {
                Ok(()) => ExecutionResult { success: true, order_id: None, error: None },
                Err(err) => ExecutionResult { success: false, order_id: None, error: Some(err.to_string()) },
            }
        }
    }
}

// ---------------------------------------------------------------------
// Target-allocation diffing: turns a set of target allocations (the active
// plan's own targets, or a rebalance step's interpolated targets) plus the
// current account snapshot into concrete orders. Sizing follows
// `sizing_engine.rs`'s target-amount-then-convert-to-shares shape; orders
// below `min_order_notional_usd` are skipped as fee-dominated noise rather
// than chased to zero drift.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RebalanceTargetConfig {
    pub min_order_notional_usd: Decimal,
}

fn to_account_market_type(market_type: crate::domain::plan::MarketType) -> MarketType {
    match market_type {
        crate::domain::plan::MarketType::Spot => MarketType::Spot,
        crate::domain::plan::MarketType::Perp => MarketType::Perp,
    }
}

/// Diffs `allocations` (percent-of-portfolio targets) against `state`'s
/// current positions and emits a `Buy`/`Sell` per under/over-allocated
/// coin, plus a `Close` for any open position no longer named in
/// `allocations` at all. A missing mid price for a coin skips that coin's
/// order rather than guessing a size.
pub fn allocations_to_actions(
    allocations: &[TargetAllocation],
    state: &AccountState,
    mid_prices: &HashMap<String, Decimal>,
    config: &RebalanceTargetConfig,
) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut targeted: HashSet<(String, MarketType)> = HashSet::new();

    for target in allocations {
        let market_type = to_account_market_type(target.market_type);
        targeted.insert((target.coin.clone(), market_type));
        let current_notional = state
            .positions
            .iter()
            .find(|p| p.coin == target.coin && p.market_type == market_type)
            .map(Position::notional)
            .unwrap_or(Decimal::ZERO);
        let target_notional = state.portfolio_value * target.target_pct / Decimal::from(100);
        if let Some(action) = diff_to_action(&target.coin, market_type, current_notional, target_notional, mid_prices, config) {
            actions.push(action);
        }
    }

    for position in &state.positions {
        if targeted.contains(&(position.coin.clone(), position.market_type)) {
            continue;
        }
        actions.push(Action {
            kind: ActionKind::Close,
            coin: position.coin.clone(),
            market_type: position.market_type,
            size: Some(position.size),
            price: None,
        });
    }

    actions
}

fn diff_to_action(
    coin: &str,
    market_type: MarketType,
    current_notional: Decimal,
    target_notional: Decimal,
    mid_prices: &HashMap<String, Decimal>,
    config: &RebalanceTargetConfig,
) -> Option<Action> {
    let drift = target_notional - current_notional;
    if drift.abs() < config.min_order_notional_usd {
        return None;
    }
    let price = *mid_prices.get(coin)?;
    if price <= Decimal::ZERO {
        return None;
    }
    let size = (drift.abs() / price).round_dp(8);
    if size.is_zero() {
        return None;
    }
    Some(Action {
        kind: if drift > Decimal::ZERO { ActionKind::Buy } else { ActionKind::Sell },
        coin: coin.to_string(),
        market_type,
        size: Some(size),
        price: None,
    })
}

// ---------------------------------------------------------------------
// Funding planner: cross-wallet USDC transfers between perp and spot.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct FundingPlannerConfig {
    pub target_initial_margin_ratio: Decimal,
    pub min_perp_balance_usd: Decimal,
    pub target_spot_usdc_buffer_usd: Decimal,
}

#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub usdc_amount: Decimal,
    pub to_perp: bool,
}

#[derive(Debug, Clone)]
pub struct PendingSpotBuy {
    pub coin: String,
    pub estimated_notional_usd: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct FundingPlanResult {
    pub actions: Vec<PendingTransfer>,
    pub inserted_transfers: Vec<PendingTransfer>,
    pub skipped_actions: Vec<(String, String)>,
    pub clamped_transfers: Vec<PendingTransfer>,
}

/// Two-phase planner, ordering preserved from the original exactly:
///
/// **Phase 1** — refill the perp wallet from spot excess: if perp balance
/// is below `target_initial_margin_ratio * total_initial_margin`, or below
/// `min_perp_balance_usd`, transfer the shortfall from spot, but never
/// more than spot's excess above `target_spot_usdc_buffer_usd`.
///
/// **Phase 2** — process each proposed action in order: existing transfers
/// are clamped to what's safely transferable; pending spot buys that
/// cannot be funded from existing spot USDC get an inserted transfer from
/// perp (clamped to perp's safety floor), or are skipped with a reason if
/// even that would breach the floor.
pub fn plan_funding(
    config: &FundingPlannerConfig,
    perp_balance_usd: Decimal,
    spot_balance_usdc: Decimal,
    total_initial_margin: Decimal,
    existing_transfers: &[PendingTransfer],
    pending_spot_buys: &[PendingSpotBuy],
) -> FundingPlanResult {
    let mut result = FundingPlanResult::default();
    let mut perp_balance = perp_balance_usd;
    let mut spot_balance = spot_balance_usdc;

    // Phase 1: refill perp from spot excess above the buffer.
    let perp_floor = (config.target_initial_margin_ratio * total_initial_margin).max(config.min_perp_balance_usd);
    if perp_balance < perp_floor {
        let shortfall = perp_floor - perp_balance;
        let spot_excess = (spot_balance - config.target_spot_usdc_buffer_usd).max(Decimal::ZERO);
        let transfer_amount = shortfall.min(spot_excess);
        if transfer_amount > Decimal::ZERO {
            result.inserted_transfers.push(PendingTransfer { usdc_amount: transfer_amount, to_perp: true });
            result.actions.push(PendingTransfer { usdc_amount: transfer_amount, to_perp: true });
            perp_balance += transfer_amount;
            spot_balance -= transfer_amount;
        }
    }

    // Phase 2: clamp existing transfers in proposal order.
    for transfer in existing_transfers {
        let clamped = process_existing_transfer(config, transfer, &mut perp_balance, &mut spot_balance, total_initial_margin);
        result.actions.push(clamped.clone());
        if clamped.usdc_amount != transfer.usdc_amount {
            result.clamped_transfers.push(clamped);
        }
    }

    // Phase 2 continued: fund or skip pending spot buys.
    for buy in pending_spot_buys {
        let available_for_buy = (spot_balance - config.target_spot_usdc_buffer_usd).max(Decimal::ZERO);
        if available_for_buy >= buy.estimated_notional_usd {
            spot_balance -= buy.estimated_notional_usd;
            continue;
        }

        let shortfall = buy.estimated_notional_usd - available_for_buy;
        let safe_from_perp = safe_transferable_from_perp(config, perp_balance, total_initial_margin);
        let transfer_amount = shortfall.min(safe_from_perp);

        if transfer_amount > Decimal::ZERO {
            result.inserted_transfers.push(PendingTransfer { usdc_amount: transfer_amount, to_perp: false });
            result.actions.push(PendingTransfer { usdc_amount: transfer_amount, to_perp: false });
            perp_balance -= transfer_amount;
            spot_balance += transfer_amount;
            if spot_balance - config.target_spot_usdc_buffer_usd < buy.estimated_notional_usd {
                result.skipped_actions.push((buy.coin.clone(), "insufficient funds after transfer".to_string()));
            } else {
                spot_balance -= buy.estimated_notional_usd;
            }
        } else {
            result.skipped_actions.push((buy.coin.clone(), "cannot fund buy without breaching perp safety floor".to_string()));
        }
    }

    result
}

fn process_existing_transfer(
    config: &FundingPlannerConfig,
    transfer: &PendingTransfer,
    perp_balance: &mut Decimal,
    spot_balance: &mut Decimal,
    total_initial_margin: Decimal,
) -> PendingTransfer {
    if transfer.to_perp {
        let spot_excess = (*spot_balance - config.target_spot_usdc_buffer_usd).max(Decimal::ZERO);
        let clamped_amount = transfer.usdc_amount.min(spot_excess);
        *perp_balance += clamped_amount;
        *spot_balance -= clamped_amount;
        PendingTransfer { usdc_amount: clamped_amount, to_perp: true }
    } else {
        let safe = safe_transferable_from_perp(config, *perp_balance, total_initial_margin);
        let clamped_amount = transfer.usdc_amount.min(safe);
        *perp_balance -= clamped_amount;
        *spot_balance += clamped_amount;
        PendingTransfer { usdc_amount: clamped_amount, to_perp: false }
    }
}

/// Maximum USDC transferable out of the perp wallet without breaching its
/// safety floor (`target_initial_margin_ratio * total_initial_margin`,
/// floored additionally at `min_perp_balance_usd`).
fn safe_transferable_from_perp(config: &FundingPlannerConfig, perp_balance: Decimal, total_initial_margin: Decimal) -> Decimal {
    let floor = (config.target_initial_margin_ratio * total_initial_margin).max(config.min_perp_balance_usd);
    (perp_balance - floor).max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_down_not_up() {
        assert_eq!(round_size(dec!(0.123456789), 4), dec!(0.1234));
    }

    #[test]
    fn rounds_down_with_nines() {
        assert_eq!(round_size(dec!(0.99999), 4), dec!(0.9999));
    }

    #[test]
    fn whole_number_input_unchanged() {
        assert_eq!(round_size(dec!(5), 4), dec!(5));
    }

    #[test]
    fn zero_decimals_truncates_to_integer() {
        assert_eq!(round_size(dec!(7.89), 0), dec!(7));
    }

    fn default_config() -> FundingPlannerConfig {
        FundingPlannerConfig { target_initial_margin_ratio: dec!(1.5), min_perp_balance_usd: dec!(100), target_spot_usdc_buffer_usd: dec!(50) }
    }

    #[test]
    fn phase_one_refills_perp_from_spot_excess() {
        let config = default_config();
        let result = plan_funding(&config, dec!(50), dec!(500), dec!(100), &[], &[]);
        // Floor = max(1.5*100, 100) = 150; shortfall = 100; spot excess = 500-50=450.
        assert_eq!(result.inserted_transfers.len(), 1);
        assert_eq!(result.inserted_transfers[0].usdc_amount, dec!(100));
        assert!(result.inserted_transfers[0].to_perp);
    }

    #[test]
    fn spot_buy_skipped_with_reason_when_unfundable() {
        let config = default_config();
        let buys = vec![PendingSpotBuy { coin: "ETH".into(), estimated_notional_usd: dec!(10000) }];
        let result = plan_funding(&config, dec!(150), dec!(50), dec!(100), &[], &buys);
        assert_eq!(result.skipped_actions.len(), 1);
        assert_eq!(result.skipped_actions[0].0, "ETH");
    }

    #[test]
    fn existing_transfer_to_perp_clamped_to_spot_excess() {
        let config = default_config();
        let transfers = vec![PendingTransfer { usdc_amount: dec!(1000), to_perp: true }];
        let result = plan_funding(&config, dec!(200), dec!(200), dec!(100), &transfers, &[]);
        // spot excess = 200-50 = 150, requested 1000 clamped to 150.
        assert_eq!(result.clamped_transfers[0].usdc_amount, dec!(150));
    }

    fn empty_state(portfolio_value: Decimal, positions: Vec<Position>) -> AccountState {
        AccountState {
            portfolio_value,
            available_balance: portfolio_value,
            account_value: portfolio_value,
            total_initial_margin: Decimal::ZERO,
            positions,
            spot_balances: HashMap::new(),
            timestamp: 0,
            is_stale: false,
        }
    }

    fn allocation(coin: &str, pct: Decimal) -> TargetAllocation {
        TargetAllocation { coin: coin.to_string(), target_pct: pct, market_type: crate::domain::plan::MarketType::Perp, leverage: Decimal::ONE }
    }

    #[test]
    fn under_allocated_coin_emits_buy() {
        let state = empty_state(dec!(10000), vec![]);
        let mid_prices = HashMap::from([("BTC".to_string(), dec!(100))]);
        let config = RebalanceTargetConfig { min_order_notional_usd: dec!(10) };
        let actions = allocations_to_actions(&[allocation("BTC", dec!(50))], &state, &mid_prices, &config);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Buy);
        assert_eq!(actions[0].size, Some(dec!(50)));
    }

    #[test]
    fn over_allocated_coin_emits_sell() {
        let position = Position {
            coin: "BTC".into(),
            market_type: MarketType::Perp,
            size: dec!(1),
            entry_price: dec!(100),
            current_price: dec!(100),
            unrealized_pnl: Decimal::ZERO,
        };
        let state = empty_state(dec!(10000), vec![position]);
        let mid_prices = HashMap::from([("BTC".to_string(), dec!(100))]);
        let config = RebalanceTargetConfig { min_order_notional_usd: dec!(10) };
        let actions = allocations_to_actions(&[allocation("BTC", dec!(0.0))], &state, &mid_prices, &config);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Sell);
        assert_eq!(actions[0].size, Some(dec!(1)));
    }

    #[test]
    fn position_absent_from_allocations_is_closed() {
        let position = Position {
            coin: "ETH".into(),
            market_type: MarketType::Perp,
            size: dec!(2),
            entry_price: dec!(50),
            current_price: dec!(50),
            unrealized_pnl: Decimal::ZERO,
        };
        let state = empty_state(dec!(10000), vec![position]);
        let mid_prices = HashMap::new();
        let config = RebalanceTargetConfig { min_order_notional_usd: dec!(10) };
        let actions = allocations_to_actions(&[], &state, &mid_prices, &config);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Close);
        assert_eq!(actions[0].coin, "ETH");
    }

    #[test]
    fn drift_below_threshold_emits_nothing() {
        let position = Position {
            coin: "BTC".into(),
            market_type: MarketType::Perp,
            size: dec!(0.5),
            entry_price: dec!(100),
            current_price: dec!(100),
            unrealized_pnl: Decimal::ZERO,
        };
        let state = empty_state(dec!(10000), vec![position]);
        let mid_prices = HashMap::from([("BTC".to_string(), dec!(100))]);
        let config = RebalanceTargetConfig { min_order_notional_usd: dec!(100) };
        // Target 0.6% * 10000 = 60, current 50; drift of 10 is below the 100 threshold.
        let actions = allocations_to_actions(&[allocation("BTC", dec!(0.6))], &state, &mid_prices, &config);
        assert!(actions.is_empty());
    }

    #[test]
    fn missing_mid_price_skips_order() {
        let state = empty_state(dec!(10000), vec![]);
        let mid_prices = HashMap::new();
        let config = RebalanceTargetConfig { min_order_notional_usd: dec!(10) };
        let actions = allocations_to_actions(&[allocation("BTC", dec!(50))], &state, &mid_prices, &config);
        assert!(actions.is_empty());
    }
}
