//! Plan Governor (C7). Grounded directly on
//! `original_source/governance/governor.py::StrategyGovernor`: review-gate
//! ordering, net-advantage approval rule, linear-interpolation rebalance
//! schedule, atomic persistence with corrupt-state-is-empty-state recovery.
//!
//! **Open question resolved** (recorded in `DESIGN.md`): `spec.md` §4.7
//! lists the review-gate checks in the order rebalancing / dwell /
//! cooldown; the original Python checks dwell / cooldown / rebalancing.
//! This implementation follows `spec.md`'s explicit numbered order, since
//! it is the authoritative distilled spec and the two orders only disagree
//! on which *reason string* comes back when multiple gates are failing
//! simultaneously, never on the overall true/false review outcome.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::domain::errors::GovernanceError;
use crate::domain::plan::{PlanStatus, RebalanceSchedule, RebalanceStep, StrategyPlanCard, TargetAllocation};
use crate::domain::repositories::{GovernorState, GovernorStateRepository};

#[derive(Debug, Clone, Copy)]
pub struct GovernorConfig {
    pub minimum_advantage_over_cost_bps: Decimal,
    pub cooldown_after_change_minutes: i64,
    pub partial_rotation_pct_per_cycle: Decimal,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        GovernorConfig {
            minimum_advantage_over_cost_bps: Decimal::new(500, 1), // 50.0
            cooldown_after_change_minutes: 60,
            partial_rotation_pct_per_cycle: Decimal::new(250, 1), // 25.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanChangeProposal {
    pub new_plan: StrategyPlanCard,
    pub expected_advantage_bps: Decimal,
    pub change_cost_bps: Decimal,
}

impl PlanChangeProposal {
    pub fn net_advantage_bps(&self) -> Decimal {
        self.expected_advantage_bps - self.change_cost_bps
    }
}

pub struct StrategyGovernor {
    config: GovernorConfig,
    repository: Arc<dyn GovernorStateRepository>,
    state: Mutex<GovernorState>,
}

impl StrategyGovernor {
    /// Loads persisted state at startup; a corrupted file is logged and
    /// treated as empty state rather than crashing.
    pub async fn load(config: GovernorConfig, repository: Arc<dyn GovernorStateRepository>) -> Self {
        let state = match repository.load().await {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = %err, "governor state corrupted, starting clean");
                GovernorState::default()
            }
        };
        StrategyGovernor { config, repository, state: Mutex::new(state) }
    }

    pub async fn active_plan(&self) -> Option<StrategyPlanCard> {
        self.state.lock().await.active_plan.clone()
    }

    /// Review gate. Checks, in `spec.md`'s explicit order: (1) rebalancing
    /// in progress, (2) dwell time (overridable by a confirmed regime
    /// change), (3) cooldown since the last change (never overridable).
    pub async fn can_review(&self, now: DateTime<Utc>, regime_changed_since_activation: bool) -> (bool, String) {
        let state = self.state.lock().await;
        let Some(plan) = &state.active_plan else {
            return (true, "no active plan, review permitted".to_string());
        };

        if plan.status == PlanStatus::Rebalancing {
            return (false, "Rebalancing in progress".to_string());
        }

        if let Some(activated_at) = plan.activated_at {
            let dwell_minutes = (now - activated_at).num_seconds() as f64 / 60.0;
            if dwell_minutes < plan.minimum_dwell_minutes as f64 {
                if regime_changed_since_activation {
                    // Falls through to the cooldown check below; dwell alone does not gate.
                } else {
                    return (
                        false,
                        format!(
                            "Dwell time not met: {:.1}/{} min",
                            dwell_minutes, plan.minimum_dwell_minutes
                        ),
                    );
                }
            }
        }

        if let Some(last_change_at) = state.last_change_at {
            let since_change_minutes = (now - last_change_at).num_seconds() as f64 / 60.0;
            if since_change_minutes < self.config.cooldown_after_change_minutes as f64 {
                return (
                    false,
                    format!(
                        "Cooldown not met: {:.1}/{} min",
                        since_change_minutes, self.config.cooldown_after_change_minutes
                    ),
                );
            }
        }

        if regime_changed_since_activation {
            return (true, "regime change override".to_string());
        }
        (true, "review permitted".to_string())
    }

    /// Evaluates a proposed plan change against the net-advantage-over-cost
    /// rule. On approval, activates the new plan (possibly with a
    /// rebalance schedule) and persists the mutation atomically inside the
    /// same critical section.
    pub async fn evaluate_proposal(&self, proposal: PlanChangeProposal, now: DateTime<Utc>) -> Result<(), GovernanceError> {
        let net_advantage = proposal.net_advantage_bps();
        if net_advantage < self.config.minimum_advantage_over_cost_bps {
            return Err(GovernanceError::ProposalRejected {
                net_advantage_bps: net_advantage,
                minimum_bps: self.config.minimum_advantage_over_cost_bps,
            });
        }

        let mut state = self.state.lock().await;
        let previous = state.active_plan.clone();
        state.last_change_at = Some(now);
        self.activate_locked(&mut state, proposal.new_plan, now, previous.as_ref());
        self.persist_locked(&state).await
    }

    /// Sets `activated_at`/`status`, and if the previous plan had
    /// overlapping allocations, installs a rebalance schedule instead of
    /// jumping straight to `active`.
    fn activate_locked(
        &self,
        state: &mut GovernorState,
        mut new_plan: StrategyPlanCard,
        now: DateTime<Utc>,
        previous: Option<&StrategyPlanCard>,
    ) {
        new_plan.activated_at = Some(now);

        let overlaps = previous
            .map(|p| plans_overlap(&p.target_allocations, &new_plan.target_allocations))
            .unwrap_or(false);

        if overlaps {
            let from = previous.unwrap().target_allocations.clone();
            let to = new_plan.target_allocations.clone();
            let schedule = create_rebalance_schedule(&from, &to, self.config.partial_rotation_pct_per_cycle);
            new_plan.status = PlanStatus::Rebalancing;
            new_plan.rebalance_progress_pct = schedule.steps.first().map(|s| s.progress_pct).unwrap_or(Decimal::ZERO);
            state.rebalance_schedule = Some(schedule);
        } else {
            new_plan.status = PlanStatus::Active;
            new_plan.rebalance_progress_pct = Decimal::new(1000, 1);
            state.rebalance_schedule = None;
        }

        state.active_plan = Some(new_plan);
    }

    /// Advances the active rebalance schedule by one step. Returns the new
    /// progress percentage, or `None` if there is no schedule in progress.
    pub async fn advance_rebalance_step(&self, now: DateTime<Utc>) -> Result<Option<Decimal>, GovernanceError> {
        let mut state = self.state.lock().await;
        let Some(schedule) = state.rebalance_schedule.clone() else { return Ok(None) };
        let Some(plan) = state.active_plan.as_mut() else { return Ok(None) };

        let mut schedule = schedule;
        if schedule.current_step >= schedule.steps.len() {
            return Ok(None);
        }
        let step = schedule.steps[schedule.current_step].clone();
        plan.target_allocations = step.allocations.clone();
        plan.rebalance_progress_pct = step.progress_pct;
        plan.last_reviewed_at = Some(now);
        schedule.current_step += 1;

        let done = schedule.current_step >= schedule.steps.len();
        if done {
            plan.status = PlanStatus::Active;
            state.rebalance_schedule = None;
        } else {
            state.rebalance_schedule = Some(schedule);
        }

        let progress = plan.rebalance_progress_pct;
        self.persist_locked(&state).await?;
        Ok(Some(progress))
    }

    /// Marks the active plan invalidated (called by tripwire handling).
    pub async fn invalidate_active_plan(&self) -> Result<(), GovernanceError> {
        let mut state = self.state.lock().await;
        if let Some(plan) = state.active_plan.as_mut() {
            plan.status = PlanStatus::Invalidated;
        }
        self.persist_locked(&state).await
    }

    async fn persist_locked(&self, state: &GovernorState) -> Result<(), GovernanceError> {
        self.repository.save(state).await
    }
}

/// Two allocation sets "overlap" (in the sense that a gradual rebalance is
/// warranted rather than an instant jump) whenever they share at least one
/// coin, matching the original's rebalance-schedule trigger.
fn plans_overlap(from: &[TargetAllocation], to: &[TargetAllocation]) -> bool {
    from.iter().any(|f| to.iter().any(|t| t.coin == f.coin))
}

/// `steps = ceil(100 / partial_rotation_pct_per_cycle)`; each step linearly
/// interpolates every coin's `target_pct` between its `from` value
/// (0 if absent) and its `to` value (0 if absent).
pub fn create_rebalance_schedule(
    from: &[TargetAllocation],
    to: &[TargetAllocation],
    partial_rotation_pct_per_cycle: Decimal,
) -> RebalanceSchedule {
    let one_hundred = Decimal::from(100);
    let steps_count = (one_hundred / partial_rotation_pct_per_cycle)
        .ceil()
        .to_i64()
        .unwrap_or(1)
        .max(1);

    let mut coins: Vec<(String, crate::domain::plan::MarketType, Decimal)> = Vec::new();
    for allocation in from.iter().chain(to.iter()) {
        if !coins.iter().any(|(c, m, _)| *c == allocation.coin && *m == allocation.market_type) {
            coins.push((allocation.coin.clone(), allocation.market_type, allocation.leverage));
        }
    }

    let from_pct = |coin: &str, market_type: crate::domain::plan::MarketType| {
        from.iter()
            .find(|a| a.coin == coin && a.market_type == market_type)
            .map(|a| a.target_pct)
            .unwrap_or(Decimal::ZERO)
    };
    let to_pct = |coin: &str, market_type: crate::domain::plan::MarketType| {
        to.iter()
            .find(|a| a.coin == coin && a.market_type == market_type)
            .map(|a| a.target_pct)
            .unwrap_or(Decimal::ZERO)
    };

    let mut steps = Vec::with_capacity(steps_count as usize);
    for step_index in 1..=steps_count {
        let progress = (partial_rotation_pct_per_cycle * Decimal::from(step_index)).min(one_hundred);
        let fraction = progress / one_hundred;
        let allocations = coins
            .iter()
            .map(|(coin, market_type, leverage)| {
                let start = from_pct(coin, *market_type);
                let end = to_pct(coin, *market_type);
                let interpolated = start + (end - start) * fraction;
                TargetAllocation { coin: coin.clone(), target_pct: interpolated, market_type: *market_type, leverage: *leverage }
            })
            .collect();
        steps.push(RebalanceStep { progress_pct: progress, allocations });
    }

    RebalanceSchedule { from_allocations: from.to_vec(), to_allocations: to.to_vec(), steps, current_step: 0 }
}

/// Linear change-cost model: fees scale with turnover, slippage has a base
/// plus linear turnover term, funding change reflects carry direction,
/// opportunity cost comes from the scorekeeper's shadow portfolios and is
/// floored at zero.
pub fn turnover_pct(from: &[TargetAllocation], to: &[TargetAllocation]) -> Decimal {
    let mut coins: Vec<String> = Vec::new();
    for allocation in from.iter().chain(to.iter()) {
        if !coins.contains(&allocation.coin) {
            coins.push(allocation.coin.clone());
        }
    }
    coins
        .iter()
        .map(|coin| {
            let start = from.iter().find(|a| a.coin == *coin).map(|a| a.target_pct).unwrap_or(Decimal::ZERO);
            let end = to.iter().find(|a| a.coin == *coin).map(|a| a.target_pct).unwrap_or(Decimal::ZERO);
            (end - start).abs()
        })
        .sum()
}

pub fn estimate_change_cost_bps(
    from: &[TargetAllocation],
    to: &[TargetAllocation],
    fee_bps_per_turnover_pct: Decimal,
    slippage_base_bps: Decimal,
    slippage_bps_per_turnover_pct: Decimal,
    funding_change_bps: Decimal,
    opportunity_cost_bps: Decimal,
) -> Decimal {
    let turnover = turnover_pct(from, to);
    let fees = fee_bps_per_turnover_pct * turnover;
    let slippage = slippage_base_bps + slippage_bps_per_turnover_pct * turnover;
    let opportunity = opportunity_cost_bps.max(Decimal::ZERO);
    fees + slippage + funding_change_bps + opportunity
}

#[allow(dead_code)]
fn dwell_override_window(activated_at: DateTime<Utc>, minimum_dwell_minutes: i64) -> DateTime<Utc> {
    activated_at + ChronoDuration::minutes(minimum_dwell_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    struct InMemoryRepo {
        state: StdMutex<GovernorState>,
    }

    #[async_trait]
    impl GovernorStateRepository for InMemoryRepo {
        async fn load(&self) -> Result<GovernorState, GovernanceError> {
            Ok(self.state.lock().unwrap().clone())
        }
        async fn save(&self, state: &GovernorState) -> Result<(), GovernanceError> {
            *self.state.lock().unwrap() = state.clone();
            Ok(())
        }
    }

    fn sample_plan(activated_at: DateTime<Utc>, minimum_dwell_minutes: i64, status: PlanStatus) -> StrategyPlanCard {
        StrategyPlanCard {
            plan_id: "A".into(),
            strategy_name: "trend".into(),
            strategy_version: "1".into(),
            created_at: activated_at,
            objective: "ride trend".into(),
            target_holding_period_hours: 24,
            time_horizon: crate::domain::plan::TimeHorizon::Hours,
            key_thesis: "btc trending".into(),
            target_allocations: vec![TargetAllocation { coin: "BTC".into(), target_pct: dec!(100), market_type: crate::domain::plan::MarketType::Perp, leverage: Decimal::ONE }],
            allowed_leverage_range: (Decimal::ONE, dec!(3)),
            risk_budget: crate::domain::plan::RiskBudget {
                max_position_pct: Default::default(), max_leverage: dec!(3),
                max_adverse_excursion_pct: dec!(10), plan_max_drawdown_pct: dec!(20), per_trade_risk_pct: dec!(1),
            },
            exit_rules: crate::domain::plan::ExitRules { profit_target_pct: None, stop_loss_pct: None, time_based_review_hours: 24, invalidation_triggers: vec![] },
            change_cost: crate::domain::plan::ChangeCostModel { estimated_fees_bps: Decimal::ZERO, estimated_slippage_bps: Decimal::ZERO, estimated_funding_change_bps: Decimal::ZERO, opportunity_cost_bps: Decimal::ZERO },
            expected_edge_bps: dec!(100),
            kpis_to_track: vec![],
            minimum_dwell_minutes,
            compatible_regimes: vec![],
            avoid_regimes: vec![],
            status,
            activated_at: Some(activated_at),
            last_reviewed_at: None,
            rebalance_progress_pct: dec!(100),
        }
    }

    async fn governor_with_plan(plan: StrategyPlanCard, last_change_at: Option<DateTime<Utc>>) -> StrategyGovernor {
        let repo = Arc::new(InMemoryRepo {
            state: StdMutex::new(GovernorState { active_plan: Some(plan), last_change_at, rebalance_schedule: None }),
        });
        StrategyGovernor::load(GovernorConfig::default(), repo).await
    }

    #[tokio::test]
    async fn dwell_blocks_review() {
        let t0 = Utc::now();
        let plan = sample_plan(t0, 120, PlanStatus::Active);
        let governor = governor_with_plan(plan, None).await;

        let (ok, reason) = governor.can_review(t0 + ChronoDuration::minutes(60), false).await;
        assert!(!ok);
        assert!(reason.contains("Dwell time not met"));

        let (ok, _) = governor.can_review(t0 + ChronoDuration::minutes(130), false).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn regime_change_overrides_dwell_but_not_rebalancing() {
        let t0 = Utc::now();
        let plan = sample_plan(t0, 120, PlanStatus::Active);
        let governor = governor_with_plan(plan, None).await;
        let (ok, reason) = governor.can_review(t0 + ChronoDuration::minutes(30), true).await;
        assert!(ok);
        assert_eq!(reason, "regime change override");

        let rebalancing_plan = sample_plan(t0, 120, PlanStatus::Rebalancing);
        let governor = governor_with_plan(rebalancing_plan, None).await;
        let (ok, reason) = governor.can_review(t0 + ChronoDuration::minutes(30), true).await;
        assert!(!ok);
        assert_eq!(reason, "Rebalancing in progress");
    }

    #[tokio::test]
    async fn proposal_rejected_on_net_advantage() {
        let t0 = Utc::now();
        let plan = sample_plan(t0, 0, PlanStatus::Active);
        let governor = governor_with_plan(plan.clone(), None).await;

        let proposal = PlanChangeProposal { new_plan: plan, expected_advantage_bps: dec!(80), change_cost_bps: dec!(50) };
        let err = governor.evaluate_proposal(proposal, t0).await.unwrap_err();
        assert!(matches!(err, GovernanceError::ProposalRejected { .. }));
        assert!(governor.active_plan().await.unwrap().status == PlanStatus::Active);
    }

    #[test]
    fn partial_rotation_schedule_matches_spec_sequence() {
        let from = vec![TargetAllocation { coin: "BTC".into(), target_pct: dec!(100), market_type: crate::domain::plan::MarketType::Perp, leverage: Decimal::ONE }];
        let to = vec![
            TargetAllocation { coin: "BTC".into(), target_pct: dec!(50), market_type: crate::domain::plan::MarketType::Perp, leverage: Decimal::ONE },
            TargetAllocation { coin: "ETH".into(), target_pct: dec!(50), market_type: crate::domain::plan::MarketType::Perp, leverage: Decimal::ONE },
        ];
        let schedule = create_rebalance_schedule(&from, &to, dec!(25));
        assert_eq!(schedule.steps.len(), 4);
        let btc_pcts: Vec<Decimal> = schedule.steps.iter().map(|s| s.allocations.iter().find(|a| a.coin == "BTC").unwrap().target_pct).collect();
        assert_eq!(btc_pcts, vec![dec!(87.5), dec!(75.0), dec!(62.5), dec!(50.0)]);
        let eth_pcts: Vec<Decimal> = schedule.steps.iter().map(|s| s.allocations.iter().find(|a| a.coin == "ETH").unwrap().target_pct).collect();
        assert_eq!(eth_pcts, vec![dec!(12.5), dec!(25.0), dec!(37.5), dec!(50.0)]);
    }
}
