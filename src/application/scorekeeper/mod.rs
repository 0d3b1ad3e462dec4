//! Scorekeeper (C9). Supplemented from `spec.md` §4.9/§3 (the original's
//! `governance/scorekeeper.py` is not present in the retrieval pack's
//! filtered file list) in the teacher's idiom: an in-memory
//! `HashMap<PlanId, PlanMetrics>` guarded the way `domain/risk/state.rs`'s
//! `RiskState` is guarded, with incremental running-average updates for
//! hit rate / slippage / drift (the same idiom
//! `application/monitoring/empirical_win_rate_provider.rs` uses for win
//! rate).

use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::domain::account::AccountState;
use crate::domain::plan::{PlanMetrics, ShadowPortfolio, StrategyPlanCard};

pub struct Scorekeeper {
    active: RwLock<HashMap<String, PlanMetrics>>,
    completed: RwLock<Vec<PlanMetrics>>,
    shadows: RwLock<HashMap<String, ShadowPortfolio>>,
}

impl Scorekeeper {
    pub fn new() -> Self {
        Scorekeeper { active: RwLock::new(HashMap::new()), completed: RwLock::new(Vec::new()), shadows: RwLock::new(HashMap::new()) }
    }

    pub async fn start_plan(&self, plan_id: &str, starting_portfolio_value: Decimal) {
        let mut active = self.active.write().await;
        active.entry(plan_id.to_string()).or_insert_with(|| PlanMetrics::new(plan_id, starting_portfolio_value));
    }

    /// Updates PnL, peak value, max drawdown, and drift-from-targets for
    /// the given plan from a fresh account snapshot.
    pub async fn record_snapshot(&self, plan: &StrategyPlanCard, state: &AccountState, plan_start_value: Decimal) {
        let mut active = self.active.write().await;
        let Some(metrics) = active.get_mut(&plan.plan_id) else { return };

        metrics.realized_pnl = state.portfolio_value - plan_start_value;
        if state.portfolio_value > metrics.peak_portfolio_value {
            metrics.peak_portfolio_value = state.portfolio_value;
        }
        if !metrics.peak_portfolio_value.is_zero() {
            let drawdown_pct = (metrics.peak_portfolio_value - state.portfolio_value) / metrics.peak_portfolio_value * Decimal::from(100);
            if drawdown_pct > metrics.max_drawdown_pct {
                metrics.max_drawdown_pct = drawdown_pct;
            }
        }

        let drift = drift_from_targets(plan, state);
        // Incremental running average over snapshots, same idiom as the
        // teacher's empirical win-rate updater.
        let n = Decimal::from(metrics.trade_count.max(1));
        metrics.avg_drift_pct = (metrics.avg_drift_pct * (n - Decimal::ONE) + drift) / n;
    }

    /// Records a completed trade's outcome, updating the running hit rate
    /// and average slippage incrementally.
    pub async fn record_trade(&self, plan_id: &str, winning: bool, slippage_bps: Decimal) {
        let mut active = self.active.write().await;
        let Some(metrics) = active.get_mut(plan_id) else { return };
        metrics.trade_count += 1;
        if winning {
            metrics.winning_trade_count += 1;
        }
        metrics.hit_rate = Decimal::from(metrics.winning_trade_count) / Decimal::from(metrics.trade_count) * Decimal::from(100);

        let n = Decimal::from(metrics.trade_count);
        metrics.avg_slippage_bps = (metrics.avg_slippage_bps * (n - Decimal::ONE) + slippage_bps) / n;
    }

    pub async fn record_rebalance(&self, plan_id: &str) {
        let mut active = self.active.write().await;
        if let Some(metrics) = active.get_mut(plan_id) {
            metrics.rebalance_count += 1;
        }
    }

    /// Finalizes the plan's metrics, moving them from the active table to
    /// the completed-plans log.
    pub async fn finalize_plan(&self, plan_id: &str) -> Option<PlanMetrics> {
        let metrics = self.active.write().await.remove(plan_id)?;
        self.completed.write().await.push(metrics.clone());
        Some(metrics)
    }

    pub async fn completed_plans(&self) -> Vec<PlanMetrics> {
        self.completed.read().await.clone()
    }

    pub async fn mark_shadow(&self, strategy_name: &str, marked_value: Decimal) {
        let mut shadows = self.shadows.write().await;
        if let Some(shadow) = shadows.get_mut(strategy_name) {
            shadow.marked_value = marked_value;
        }
    }

    pub async fn register_shadow(&self, shadow: ShadowPortfolio) {
        self.shadows.write().await.insert(shadow.strategy_name.clone(), shadow);
    }

    /// Best-performing shadow's PnL, feeding the governor's opportunity-cost
    /// estimate; floored at 0 by the caller (`estimate_change_cost_bps`).
    pub async fn best_shadow_pnl(&self) -> Decimal {
        self.shadows.read().await.values().map(ShadowPortfolio::pnl).fold(Decimal::MIN, Decimal::max).max(Decimal::ZERO)
    }
}

impl Default for Scorekeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean absolute deviation of actual allocation pct vs. target pct across
/// all target allocations.
fn drift_from_targets(plan: &StrategyPlanCard, state: &AccountState) -> Decimal {
    if plan.target_allocations.is_empty() || state.portfolio_value.is_zero() {
        return Decimal::ZERO;
    }
    let deviations: Vec<Decimal> = plan
        .target_allocations
        .iter()
        .map(|target| {
            let actual_pct = state
                .positions
                .iter()
                .filter(|p| p.coin == target.coin)
                .map(|p| p.notional() / state.portfolio_value * Decimal::from(100))
                .sum::<Decimal>();
            (actual_pct - target.target_pct).abs()
        })
        .collect();
    deviations.iter().sum::<Decimal>() / Decimal::from(deviations.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;

    #[tokio::test]
    async fn hit_rate_and_slippage_update_incrementally() {
        let scorekeeper = Scorekeeper::new();
        scorekeeper.start_plan("p1", dec!(10000)).await;
        scorekeeper.record_trade("p1", true, dec!(2)).await;
        scorekeeper.record_trade("p1", false, dec!(4)).await;
        let metrics = scorekeeper.active.read().await.get("p1").cloned().unwrap();
        assert_eq!(metrics.hit_rate, dec!(50));
        assert_eq!(metrics.avg_slippage_bps, dec!(3));
    }

    #[tokio::test]
    async fn max_drawdown_tracks_worst_point() {
        let scorekeeper = Scorekeeper::new();
        scorekeeper.start_plan("p1", dec!(10000)).await;
        let plan = crate::domain::plan::StrategyPlanCard {
            plan_id: "p1".into(), strategy_name: "s".into(), strategy_version: "1".into(), created_at: chrono::Utc::now(),
            objective: "o".into(), target_holding_period_hours: 1, time_horizon: crate::domain::plan::TimeHorizon::Hours, key_thesis: "k".into(),
            target_allocations: vec![], allowed_leverage_range: (Decimal::ONE, Decimal::ONE),
            risk_budget: crate::domain::plan::RiskBudget { max_position_pct: Default::default(), max_leverage: Decimal::ONE, max_adverse_excursion_pct: Decimal::ZERO, plan_max_drawdown_pct: Decimal::ZERO, per_trade_risk_pct: Decimal::ZERO },
            exit_rules: crate::domain::plan::ExitRules { profit_target_pct: None, stop_loss_pct: None, time_based_review_hours: 1, invalidation_triggers: vec![] },
            change_cost: crate::domain::plan::ChangeCostModel { estimated_fees_bps: Decimal::ZERO, estimated_slippage_bps: Decimal::ZERO, estimated_funding_change_bps: Decimal::ZERO, opportunity_cost_bps: Decimal::ZERO },
            expected_edge_bps: Decimal::ZERO, kpis_to_track: vec![], minimum_dwell_minutes: 0,
            compatible_regimes: vec![], avoid_regimes: vec![], status: crate::domain::plan::PlanStatus::Active,
            activated_at: Some(chrono::Utc::now()), last_reviewed_at: None, rebalance_progress_pct: Decimal::ZERO,
        };
        let state_high = AccountState { portfolio_value: dec!(12000), available_balance: dec!(1000), account_value: dec!(12000), total_initial_margin: dec!(0), positions: vec![], spot_balances: StdHashMap::new(), timestamp: 0, is_stale: false };
        let state_low = AccountState { portfolio_value: dec!(9000), ..state_high.clone() };
        scorekeeper.record_snapshot(&plan, &state_high, dec!(10000)).await;
        scorekeeper.record_snapshot(&plan, &state_low, dec!(10000)).await;
        let metrics = scorekeeper.active.read().await.get("p1").cloned().unwrap();
        assert_eq!(metrics.max_drawdown_pct, (dec!(12000) - dec!(9000)) / dec!(12000) * dec!(100));
    }
}
