//! Tripwire Service (C8). Grounded on
//! `application/risk_management/circuit_breaker_service.rs`'s
//! multi-predicate-returns-highest-priority-event shape, and on
//! `original_source/langgraph/nodes/tripwire_check.py` plus
//! `original_source/tests/unit/test_tripwire.py` for exact predicate
//! semantics and the invalidation-trigger grammar.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::domain::account::AccountState;
use crate::domain::plan::StrategyPlanCard;
use crate::domain::tripwire::{Category, Severity, TripwireAction, TripwireEvent};

#[derive(Debug, Clone, Copy)]
pub struct TripwireConfig {
    pub min_margin_ratio: Decimal,
    pub liquidation_proximity_threshold: Decimal,
    pub daily_loss_limit_pct: Decimal,
    pub check_invalidation_triggers: bool,
    pub max_data_staleness_seconds: i64,
    pub max_api_failure_count: u32,
}

impl Default for TripwireConfig {
    fn default() -> Self {
        TripwireConfig {
            min_margin_ratio: Decimal::new(15, 2),
            liquidation_proximity_threshold: Decimal::new(25, 2),
            daily_loss_limit_pct: Decimal::new(50, 1),
            check_invalidation_triggers: true,
            max_data_staleness_seconds: 300,
            max_api_failure_count: 3,
        }
    }
}

fn detail(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

pub struct TripwireService {
    config: TripwireConfig,
    /// Session baseline portfolio value for the daily-loss predicate; set
    /// on first evaluation of the session, matching the original's
    /// "if session baseline not set, set it to current" behavior.
    session_baseline: AtomicI64,
}

const BASELINE_UNSET: i64 = i64::MIN;

impl TripwireService {
    pub fn new(config: TripwireConfig) -> Self {
        TripwireService { config, session_baseline: AtomicI64::new(BASELINE_UNSET) }
    }

    /// Resets the daily-loss baseline, e.g. at the start of a new trading day.
    pub fn reset_baseline(&self) {
        self.session_baseline.store(BASELINE_UNSET, Ordering::Relaxed);
    }

    /// Runs all three predicate groups and returns events sorted by
    /// priority (account_safety > plan_invalidation > operational, with
    /// critical before warning within a category). Never raises: a
    /// panicking predicate is caught and converted into a synthesized
    /// `critical/operational/FREEZE_NEW_RISK` event, per `spec.md` §7.
    pub fn check_all(&self, account_state: &AccountState, active_plan: Option<&StrategyPlanCard>, api_failure_count: u32) -> Vec<TripwireEvent> {
        let now = Utc::now();
        let mut events = Vec::new();

        match catch_unwind(AssertUnwindSafe(|| self.check_account_safety(account_state, now))) {
            Ok(mut found) => events.append(&mut found),
            Err(_) => events.push(panic_event(now, "account_safety predicate panicked")),
        }

        if self.config.check_invalidation_triggers {
            match catch_unwind(AssertUnwindSafe(|| self.check_plan_invalidation(account_state, active_plan, now))) {
                Ok(mut found) => events.append(&mut found),
                Err(_) => events.push(panic_event(now, "plan_invalidation predicate panicked")),
            }
        }

        match catch_unwind(AssertUnwindSafe(|| self.check_operational(account_state, api_failure_count, now))) {
            Ok(mut found) => events.append(&mut found),
            Err(_) => events.push(panic_event(now, "operational predicate panicked")),
        }

        events.sort_by_key(TripwireEvent::priority_key);
        events
    }

    fn check_account_safety(&self, state: &AccountState, now: DateTime<Utc>) -> Vec<TripwireEvent> {
        let mut events = Vec::new();

        let baseline_raw = self.session_baseline.load(Ordering::Relaxed);
        let baseline = if baseline_raw == BASELINE_UNSET {
            let current = decimal_to_micros(state.portfolio_value);
            self.session_baseline.store(current, Ordering::Relaxed);
            state.portfolio_value
        } else {
            micros_to_decimal(baseline_raw)
        };

        if !baseline.is_zero() {
            let loss_pct = (baseline - state.portfolio_value) / baseline * Decimal::from(100);
            if loss_pct >= self.config.daily_loss_limit_pct {
                events.push(TripwireEvent {
                    severity: Severity::Critical,
                    category: Category::AccountSafety,
                    trigger: "daily_loss_limit".into(),
                    action: TripwireAction::CutSizeToFloor,
                    timestamp: now,
                    details: detail(&[("loss_pct", loss_pct.round_dp(2).to_string())]),
                });
            }
        }

        if !state.portfolio_value.is_zero() {
            let margin_ratio = state.available_balance / state.portfolio_value;
            if margin_ratio < self.config.min_margin_ratio {
                events.push(TripwireEvent {
                    severity: Severity::Critical,
                    category: Category::AccountSafety,
                    trigger: "low_margin_ratio".into(),
                    action: TripwireAction::CutSizeToFloor,
                    timestamp: now,
                    details: detail(&[("margin_ratio", margin_ratio.round_dp(4).to_string())]),
                });
            }
        }

        let proximity = state.negative_pnl_fraction();
        if proximity >= self.config.liquidation_proximity_threshold {
            events.push(TripwireEvent {
                severity: Severity::Critical,
                category: Category::AccountSafety,
                trigger: "liquidation_proximity".into(),
                action: TripwireAction::EscalateToSlowLoop,
                timestamp: now,
                details: detail(&[("proximity", proximity.round_dp(4).to_string())]),
            });
        }

        events
    }

    fn check_plan_invalidation(&self, state: &AccountState, active_plan: Option<&StrategyPlanCard>, now: DateTime<Utc>) -> Vec<TripwireEvent> {
        let Some(plan) = active_plan else { return Vec::new() };
        let mut events = Vec::new();
        for trigger in &plan.exit_rules.invalidation_triggers {
            if evaluate_invalidation_trigger(trigger, state) {
                events.push(TripwireEvent {
                    severity: Severity::Warning,
                    category: Category::PlanInvalidation,
                    trigger: trigger.clone(),
                    action: TripwireAction::InvalidatePlan,
                    timestamp: now,
                    details: detail(&[("plan_id", plan.plan_id.clone())]),
                });
            }
        }
        events
    }

    fn check_operational(&self, state: &AccountState, api_failure_count: u32, now: DateTime<Utc>) -> Vec<TripwireEvent> {
        let mut events = Vec::new();
        let age_seconds = now.timestamp() - state.timestamp;
        if state.is_stale || age_seconds > self.config.max_data_staleness_seconds {
            events.push(TripwireEvent {
                severity: Severity::Warning,
                category: Category::Operational,
                trigger: "stale_data".into(),
                action: TripwireAction::FreezeNewRisk,
                timestamp: now,
                details: detail(&[("age_seconds", age_seconds.to_string())]),
            });
        }
        if api_failure_count >= self.config.max_api_failure_count {
            events.push(TripwireEvent {
                severity: Severity::Critical,
                category: Category::Operational,
                trigger: "api_failure_burst".into(),
                action: TripwireAction::FreezeNewRisk,
                timestamp: now,
                details: detail(&[("api_failure_count", api_failure_count.to_string())]),
            });
        }
        events
    }
}

fn panic_event(now: DateTime<Utc>, reason: &str) -> TripwireEvent {
    TripwireEvent {
        severity: Severity::Critical,
        category: Category::Operational,
        trigger: "predicate_panic".into(),
        action: TripwireAction::FreezeNewRisk,
        timestamp: now,
        details: detail(&[("reason", reason.to_string())]),
    }
}

fn decimal_to_micros(value: Decimal) -> i64 {
    (value * Decimal::from(1_000_000)).to_i64().unwrap_or(0)
}

fn micros_to_decimal(micros: i64) -> Decimal {
    Decimal::from(micros) / Decimal::from(1_000_000)
}

/// Small closed grammar over free-text invalidation predicates:
/// `position size exceeds N% of portfolio` and `drawdown exceeds N%` are
/// recognized and evaluated against absolute notional / unrealized loss.
/// `funding rate ...` and `volatility exceeds N%` are recognized by
/// keyword but intentionally always evaluate to `false` — those data
/// points are not yet wired into `AccountState`, matching the original's
/// documented behavior (`test_evaluate_trigger_funding_rate_negative`,
/// `test_evaluate_trigger_volatility_spike`). Unrecognized text never
/// fires.
fn evaluate_invalidation_trigger(trigger: &str, state: &AccountState) -> bool {
    let lower = trigger.to_lowercase();

    if lower.contains("position size exceeds") && lower.contains("% of portfolio") {
        if let Some(threshold) = extract_first_percent(&lower) {
            if state.portfolio_value.is_zero() {
                return false;
            }
            let max_notional_pct = state
                .positions
                .iter()
                .map(|p| p.notional() / state.portfolio_value * Decimal::from(100))
                .fold(Decimal::ZERO, |acc, pct| acc.max(pct));
            return max_notional_pct > threshold;
        }
        return false;
    }

    if lower.contains("drawdown exceeds") {
        if let Some(threshold) = extract_first_percent(&lower) {
            if state.portfolio_value.is_zero() {
                return false;
            }
            let total_unrealized: Decimal = state.positions.iter().map(|p| p.unrealized_pnl).sum();
            if total_unrealized >= Decimal::ZERO {
                return false;
            }
            let loss_pct = (-total_unrealized) / state.portfolio_value * Decimal::from(100);
            return loss_pct > threshold;
        }
        return false;
    }

    // Recognized but intentionally never fire (not wired into AccountState):
    if lower.contains("funding rate") || lower.contains("volatility exceeds") {
        return false;
    }

    false
}

fn extract_first_percent(text: &str) -> Option<Decimal> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse::<Decimal>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;
    use crate::domain::account::{MarketType, Position};

    fn account(portfolio_value: Decimal, available: Decimal, positions: Vec<Position>) -> AccountState {
        AccountState {
            portfolio_value,
            available_balance: available,
            account_value: portfolio_value,
            total_initial_margin: dec!(0),
            positions,
            spot_balances: StdHashMap::new(),
            timestamp: Utc::now().timestamp(),
            is_stale: false,
        }
    }

    #[test]
    fn daily_loss_tripwire_fires_on_five_percent_drop() {
        let service = TripwireService::new(TripwireConfig::default());
        service.check_all(&account(dec!(10000), dec!(5000), vec![]), None, 0);
        let events = service.check_all(&account(dec!(9400), dec!(5000), vec![]), None, 0);
        let event = events.iter().find(|e| e.trigger == "daily_loss_limit").unwrap();
        assert_eq!(event.action, TripwireAction::CutSizeToFloor);
        let loss_pct: f64 = event.details["loss_pct"].parse().unwrap();
        assert!(loss_pct >= 5.0);
    }

    #[test]
    fn stale_data_freezes_new_risk() {
        let service = TripwireService::new(TripwireConfig::default());
        let mut state = account(dec!(10000), dec!(5000), vec![]);
        state.is_stale = true;
        let events = service.check_all(&state, None, 0);
        assert!(events.iter().any(|e| e.trigger == "stale_data" && e.action == TripwireAction::FreezeNewRisk));
    }

    #[test]
    fn position_size_trigger_uses_absolute_notional() {
        let service = TripwireService::new(TripwireConfig::default());
        let position = Position { coin: "BTC".into(), market_type: MarketType::Perp, size: dec!(0.15), entry_price: dec!(50000), current_price: dec!(50000), unrealized_pnl: dec!(0) };
        let mut state = account(dec!(10000), dec!(5000), vec![position]);
        state.timestamp = Utc::now().timestamp();
        let plan = sample_plan(vec!["position size exceeds 50% of portfolio".into()]);
        let events = service.check_all(&state, Some(&plan), 0);
        assert!(events.iter().any(|e| e.action == TripwireAction::InvalidatePlan));
    }

    #[test]
    fn unrecognized_pattern_never_fires() {
        let service = TripwireService::new(TripwireConfig::default());
        let state = account(dec!(10000), dec!(5000), vec![]);
        let plan = sample_plan(vec!["the moon turns purple".into()]);
        let events = service.check_all(&state, Some(&plan), 0);
        assert!(!events.iter().any(|e| e.action == TripwireAction::InvalidatePlan));
    }

    #[test]
    fn funding_rate_trigger_recognized_but_never_fires() {
        let service = TripwireService::new(TripwireConfig::default());
        let state = account(dec!(10000), dec!(5000), vec![]);
        let plan = sample_plan(vec!["funding rate exceeds 0.1%".into()]);
        let events = service.check_all(&state, Some(&plan), 0);
        assert!(!events.iter().any(|e| e.action == TripwireAction::InvalidatePlan));
    }

    #[test]
    fn priority_orders_account_safety_above_operational() {
        let service = TripwireService::new(TripwireConfig::default());
        let mut state = account(dec!(10000), dec!(1000), vec![]);
        state.is_stale = true;
        let events = service.check_all(&state, None, 10);
        assert_eq!(events[0].category, Category::AccountSafety);
    }

    fn sample_plan(invalidation_triggers: Vec<String>) -> StrategyPlanCard {
        StrategyPlanCard {
            plan_id: "p1".into(),
            strategy_name: "s".into(),
            strategy_version: "1".into(),
            created_at: Utc::now(),
            objective: "o".into(),
            target_holding_period_hours: 1,
            time_horizon: crate::domain::plan::TimeHorizon::Hours,
            key_thesis: "k".into(),
            target_allocations: vec![],
            allowed_leverage_range: (Decimal::ONE, Decimal::ONE),
            risk_budget: crate::domain::plan::RiskBudget { max_position_pct: Default::default(), max_leverage: Decimal::ONE, max_adverse_excursion_pct: Decimal::ZERO, plan_max_drawdown_pct: Decimal::ZERO, per_trade_risk_pct: Decimal::ZERO },
            exit_rules: crate::domain::plan::ExitRules { profit_target_pct: None, stop_loss_pct: None, time_based_review_hours: 1, invalidation_triggers },
            change_cost: crate::domain::plan::ChangeCostModel { estimated_fees_bps: Decimal::ZERO, estimated_slippage_bps: Decimal::ZERO, estimated_funding_change_bps: Decimal::ZERO, opportunity_cost_bps: Decimal::ZERO },
            expected_edge_bps: Decimal::ZERO,
            kpis_to_track: vec![],
            minimum_dwell_minutes: 0,
            compatible_regimes: vec![],
            avoid_regimes: vec![],
            status: crate::domain::plan::PlanStatus::Active,
            activated_at: Some(Utc::now()),
            last_reviewed_at: None,
            rebalance_progress_pct: Decimal::ZERO,
        }
    }
}
