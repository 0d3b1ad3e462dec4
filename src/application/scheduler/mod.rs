//! Multi-timescale Scheduler (C11). Grounded on
//! `original_source/governed_agent.py`'s `run()` /
//! `_should_run_medium_loop` / `_should_run_slow_loop` /
//! `_handle_tripwire_events` shape for the due-loop decision logic and the
//! `ESCALATE_TO_SLOW_LOOP` ⇒ `last_slow_loop = None` rule, re-expressed
//! with genuine concurrency (the original is single-threaded) on top of
//! the teacher's `application/system/mod.rs::Application` bootstrap-and-spawn
//! pattern and `application/agents/sentinel.rs`'s `tokio::select!`-based
//! supervised-loop shape. Each loop is a `tokio::spawn`ed task per tick;
//! `tokio::time::timeout` bounds each, and the tick completes only when
//! every launched loop has finished or timed out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::application::executor::{self, Action, ActionKind, FundingPlannerConfig, PendingSpotBuy, RebalanceTargetConfig};
use crate::application::governor::{PlanChangeProposal, StrategyGovernor};
use crate::application::monitor::AccountMonitor;
use crate::application::orchestrator::{self, ProviderTask, SignalRequest};
use crate::application::providers::ApiFailureCounter;
use crate::application::regime::RegimeDetector;
use crate::application::scorekeeper::Scorekeeper;
use crate::application::signal_processor::build_regime_signals;
use crate::application::tripwire::TripwireService;
use crate::domain::account::{AccountState, MarketType};
use crate::domain::plan::{PlanStatus, TargetAllocation};
use crate::domain::ports::{Exchange, Oracle, PlanProposal};
use crate::domain::regime::RegimeClassification;
use crate::domain::signals::{Candle, MacroEvent, SignalBundle, SignalKind};
use crate::domain::tripwire::TripwireAction;

/// Builds the provider task list for a given cadence. Injected rather than
/// owned by the scheduler so the fan-out wiring (which sources, which
/// coins, cache-wrapping) stays the caller's concern, per `spec.md` §4.3's
/// separation between orchestration and provider configuration.
pub type SignalTaskBuilder = Arc<dyn Fn(SignalKind) -> Vec<ProviderTask> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub fast_interval: StdDuration,
    pub medium_interval: ChronoDuration,
    pub slow_interval: ChronoDuration,
    pub fast_deadline: StdDuration,
    pub medium_deadline: StdDuration,
    pub slow_deadline: StdDuration,
    pub emergency_reduction_pct: Decimal,
    pub auto_transfer_enabled: bool,
    pub funding: FundingPlannerConfig,
}

/// Owns the three cooperating loops and the scheduling state
/// (`last_medium_loop` / `last_slow_loop`) that decides which are due on a
/// given tick. Everything it touches that is also touched by another loop
/// (governor state, account monitor's last-good snapshot, circuit breakers)
/// is already serialized by that component; the scheduler adds no locking
/// of its own beyond its own bookkeeping fields.
pub struct Scheduler {
    monitor: Arc<AccountMonitor>,
    tripwire: Arc<TripwireService>,
    governor: Arc<StrategyGovernor>,
    regime_detector: Mutex<RegimeDetector>,
    scorekeeper: Arc<Scorekeeper>,
    oracle: Arc<dyn Oracle>,
    exchange: Arc<dyn Exchange>,
    signal_tasks: SignalTaskBuilder,
    api_failures: Arc<ApiFailureCounter>,
    candle_history: Mutex<Vec<Candle>>,
    macro_calendar: Mutex<Vec<MacroEvent>>,
    regime_changed_since_activation: Mutex<bool>,
    plan_start_values: Mutex<HashMap<String, Decimal>>,
    last_medium_loop: Mutex<Option<DateTime<Utc>>>,
    last_slow_loop: Mutex<Option<DateTime<Utc>>>,
    config: SchedulerConfig,
    rebalance_target_config: RebalanceTargetConfig,
    sz_decimals: u32,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitor: Arc<AccountMonitor>,
        tripwire: Arc<TripwireService>,
        governor: Arc<StrategyGovernor>,
        regime_detector: RegimeDetector,
        scorekeeper: Arc<Scorekeeper>,
        oracle: Arc<dyn Oracle>,
        exchange: Arc<dyn Exchange>,
        signal_tasks: SignalTaskBuilder,
        api_failures: Arc<ApiFailureCounter>,
        config: SchedulerConfig,
        rebalance_target_config: RebalanceTargetConfig,
        sz_decimals: u32,
    ) -> Self {
        Scheduler {
            monitor,
            tripwire,
            governor,
            regime_detector: Mutex::new(regime_detector),
            scorekeeper,
            oracle,
            exchange,
            signal_tasks,
            api_failures,
            candle_history: Mutex::new(Vec::new()),
            macro_calendar: Mutex::new(Vec::new()),
            regime_changed_since_activation: Mutex::new(false),
            plan_start_values: Mutex::new(HashMap::new()),
            last_medium_loop: Mutex::new(None),
            last_slow_loop: Mutex::new(None),
            config,
            rebalance_target_config,
            sz_decimals,
        }
    }

    /// Ticks at the fast interval until `shutdown` reports `true`. A tick
    /// already in flight always finishes (bounded by the slow-loop
    /// deadline) before the loop exits, per `spec.md` §5's shutdown rule.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.fast_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        info!("scheduler: shutdown observed before tick start, exiting");
                        return;
                    }
                    Arc::clone(&self).tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler: shutdown signal received, exiting after current tick");
                        return;
                    }
                }
            }
        }
    }

    async fn tick(self: Arc<Self>) {
        let now = Utc::now();
        let due_medium = self.is_medium_due(now).await;
        let due_slow = self.is_slow_due(now).await;

        let mut handles = Vec::with_capacity(3);

        {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                if timeout(this.config.fast_deadline, this.run_fast_loop(now)).await.is_err() {
                    warn!("fast loop exceeded its deadline");
                }
            }));
        }

        if due_medium {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                if timeout(this.config.medium_deadline, this.run_medium_loop(now)).await.is_err() {
                    warn!("medium loop exceeded its deadline");
                }
                *this.last_medium_loop.lock().await = Some(now);
            }));
        }

        if due_slow {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                if timeout(this.config.slow_deadline, this.run_slow_loop(now)).await.is_err() {
                    warn!("slow loop exceeded its deadline");
                }
                *this.last_slow_loop.lock().await = Some(now);
            }));
        }

        // Each loop runs in its own task: a panic in one is caught by tokio
        // as a `JoinError` here rather than taking down the others, and a
        // returned (non-panicking) failure is already logged and swallowed
        // inside the loop body itself, per `spec.md` §5's failure-isolation
        // rule.
        for handle in handles {
            if let Err(join_err) = handle.await {
                error!(error = %join_err, "scheduler loop task panicked");
            }
        }
    }

    async fn is_medium_due(&self, now: DateTime<Utc>) -> bool {
        match *self.last_medium_loop.lock().await {
            None => true,
            Some(last) => now - last >= self.config.medium_interval,
        }
    }

    /// `None` means "due immediately" — this is also how
    /// `ESCALATE_TO_SLOW_LOOP` forces the next tick to run the slow loop.
    async fn is_slow_due(&self, now: DateTime<Utc>) -> bool {
        match *self.last_slow_loop.lock().await {
            None => true,
            Some(last) => now - last >= self.config.slow_interval,
        }
    }

    async fn collect_signals(&self, kind: SignalKind) -> SignalBundle {
        let tasks = (self.signal_tasks)(kind);
        orchestrator::collect(SignalRequest::new(kind), tasks).await
    }

    async fn plan_start_value(&self, plan_id: &str, current_value: Decimal) -> Decimal {
        let mut values = self.plan_start_values.lock().await;
        *values.entry(plan_id.to_string()).or_insert(current_value)
    }

    async fn mid_prices_for(&self, allocations: &[TargetAllocation]) -> HashMap<String, Decimal> {
        let mut prices = HashMap::new();
        for allocation in allocations {
            if prices.contains_key(&allocation.coin) {
                continue;
            }
            match self.exchange.mid_price(&allocation.coin).await {
                Ok(price) => {
                    prices.insert(allocation.coin.clone(), price);
                }
                Err(err) => warn!(coin = %allocation.coin, error = %err, "mid price unavailable, skipping coin this tick"),
            }
        }
        prices
    }

    // ----------------------------------------------------------------
    // Fast loop: snapshot -> signals -> tripwires -> execution -> score.
    // ----------------------------------------------------------------

    async fn run_fast_loop(&self, now: DateTime<Utc>) {
        let account_state = match self.monitor.snapshot().await {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "fast loop: no account snapshot available, skipping tick");
                return;
            }
        };

        let bundle = self.collect_signals(SignalKind::Fast).await;
        if bundle.metadata.confidence > 0.0 {
            self.api_failures.record_success();
        } else {
            self.api_failures.record_failure();
        }

        let active_plan = self.governor.active_plan().await;
        let events = self.tripwire.check_all(&account_state, active_plan.as_ref(), self.api_failures.count());

        let mut freeze_new_risk = false;
        let mut cut_to_floor = false;
        for event in &events {
            info!(
                category = ?event.category,
                severity = ?event.severity,
                action = ?event.action,
                trigger = %event.trigger,
                "tripwire event"
            );
            match event.action {
                TripwireAction::EscalateToSlowLoop => {
                    *self.last_slow_loop.lock().await = None;
                }
                TripwireAction::InvalidatePlan => {
                    if let Err(err) = self.governor.invalidate_active_plan().await {
                        error!(error = %err, "failed to invalidate plan after tripwire");
                    }
                }
                TripwireAction::FreezeNewRisk => freeze_new_risk = true,
                TripwireAction::CutSizeToFloor => cut_to_floor = true,
            }
        }

        let Some(plan) = self.governor.active_plan().await else { return };
        if !matches!(plan.status, PlanStatus::Active | PlanStatus::Rebalancing) {
            return;
        }

        let mut allocations = plan.target_allocations.clone();
        if plan.status == PlanStatus::Rebalancing {
            match self.governor.advance_rebalance_step(now).await {
                Ok(Some(_)) => {
                    if let Some(advanced) = self.governor.active_plan().await {
                        allocations = advanced.target_allocations;
                    }
                }
                Ok(None) => {}
                Err(err) => error!(error = %err, "fast loop: rebalance step advance failed"),
            }
        }

        if cut_to_floor {
            allocations = floor_allocations(&allocations, self.config.emergency_reduction_pct);
        }

        let mid_prices = self.mid_prices_for(&allocations).await;
        let mut actions = executor::allocations_to_actions(&allocations, &account_state, &mid_prices, &self.rebalance_target_config);

        // Staleness rule (`spec.md` §5): stale data or a freeze tripwire
        // still permits exits, never anything that adds gross exposure.
        if account_state.is_stale || freeze_new_risk {
            actions.retain(|a| matches!(a.kind, ActionKind::Sell | ActionKind::Close | ActionKind::Hold));
        }

        if self.config.auto_transfer_enabled {
            self.plan_transfers(&mut actions, &account_state, &mid_prices);
        }

        for action in actions {
            let coin = action.coin.clone();
            let result = executor::execute(&self.exchange, action, self.sz_decimals).await;
            if !result.success {
                warn!(coin = %coin, error = ?result.error, "order execution failed");
            }
        }

        let plan_start_value = self.plan_start_value(&plan.plan_id, account_state.portfolio_value).await;
        self.scorekeeper.record_snapshot(&plan, &account_state, plan_start_value).await;
    }

    // ----------------------------------------------------------------
    // Medium loop: signals -> regime -> (gated) oracle review -> activate.
    // ----------------------------------------------------------------

    async fn run_medium_loop(&self, now: DateTime<Utc>) {
        let account_state = match self.monitor.snapshot().await {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "medium loop: no account snapshot available, skipping review");
                return;
            }
        };

        let bundle = self.collect_signals(SignalKind::Medium).await;
        self.remember_candles(&bundle).await;
        let history = self.candle_history.lock().await.clone();
        let regime_signals = build_regime_signals(&bundle, &history);
        let calendar = self.macro_calendar.lock().await.clone();

        let Some(classification) = self.classify(now, &regime_signals, &calendar).await else {
            // A failed classification leaves `current_regime` unchanged and
            // advances no confirmation, per `spec.md` §7.
            return;
        };

        let (changed, reason) = {
            let mut detector = self.regime_detector.lock().await;
            detector.update_and_confirm(&classification)
        };
        info!(regime = %classification.regime, changed, reason = %reason, "medium loop: regime update");

        let regime_changed_since_activation = {
            let mut flag = self.regime_changed_since_activation.lock().await;
            if changed {
                *flag = true;
            }
            *flag
        };

        let (can_review, review_reason) = self.governor.can_review(now, regime_changed_since_activation).await;
        if !can_review {
            info!(reason = %review_reason, "medium loop: review gate closed");
            return;
        }

        let proposal = match self.oracle.propose_plan(&account_state, &regime_signals, &classification).await {
            Ok(proposal) => proposal,
            Err(err) => {
                error!(error = %err, "medium loop: plan proposal call failed, plan unchanged");
                return;
            }
        };

        match proposal {
            PlanProposal::NoChange => info!("medium loop: oracle proposed no change"),
            PlanProposal::Change { new_plan, expected_advantage_bps } => {
                let change_cost_bps = new_plan.change_cost.total_cost_bps();
                let proposal = PlanChangeProposal { new_plan, expected_advantage_bps, change_cost_bps };
                let net_advantage = proposal.net_advantage_bps();
                match self.governor.evaluate_proposal(proposal, now).await {
                    Ok(()) => {
                        *self.regime_changed_since_activation.lock().await = false;
                        if let Some(active) = self.governor.active_plan().await {
                            self.scorekeeper.start_plan(&active.plan_id, account_state.portfolio_value).await;
                            self.plan_start_values.lock().await.insert(active.plan_id.clone(), account_state.portfolio_value);
                            info!(plan_id = %active.plan_id, net_advantage_bps = %net_advantage, "medium loop: plan change activated");
                        }
                    }
                    Err(err) => warn!(error = %err, "medium loop: plan change proposal rejected"),
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // Slow loop: signals -> macro calendar refresh -> forced reclassify.
    // ----------------------------------------------------------------

    async fn run_slow_loop(&self, now: DateTime<Utc>) {
        if self.monitor.snapshot().await.is_err() {
            error!("slow loop: no account snapshot available");
            return;
        }

        let bundle = self.collect_signals(SignalKind::Slow).await;
        if let Some(events) = bundle.macro_calendar.as_ref().and_then(|f| f.value()) {
            *self.macro_calendar.lock().await = events.clone();
        }
        self.remember_candles(&bundle).await;

        let history = self.candle_history.lock().await.clone();
        let regime_signals = build_regime_signals(&bundle, &history);
        let calendar = self.macro_calendar.lock().await.clone();

        let Some(classification) = self.classify(now, &regime_signals, &calendar).await else {
            return;
        };

        let (changed, reason) = {
            let mut detector = self.regime_detector.lock().await;
            detector.update_and_confirm(&classification)
        };
        if changed {
            *self.regime_changed_since_activation.lock().await = true;
            info!(regime = %classification.regime, reason = %reason, "slow loop: structural regime change");
        } else {
            info!(reason = %reason, "slow loop: no structural regime change");
        }
    }

    /// Runs the funding planner (`spec.md` §4.10) over this tick's pending
    /// spot buys before they execute: inserts perp/spot USDC transfers
    /// ahead of buys that can't be funded from spot alone, and drops any
    /// buy the planner can't fund even after transferring, logging why.
    fn plan_transfers(&self, actions: &mut Vec<Action>, account_state: &AccountState, mid_prices: &HashMap<String, Decimal>) {
        let pending_buys: Vec<PendingSpotBuy> = actions
            .iter()
            .filter(|a| a.kind == ActionKind::Buy && a.market_type == MarketType::Spot)
            .map(|a| PendingSpotBuy {
                coin: a.coin.clone(),
                estimated_notional_usd: a.size.unwrap_or(Decimal::ZERO) * mid_prices.get(&a.coin).copied().unwrap_or(Decimal::ZERO),
            })
            .collect();
        if pending_buys.is_empty() {
            return;
        }

        let perp_balance = account_state.available_balance;
        let spot_balance = account_state.spot_balances.get("USDC").copied().unwrap_or(Decimal::ZERO);
        let plan = executor::plan_funding(&self.config.funding, perp_balance, spot_balance, account_state.total_initial_margin, &[], &pending_buys);

        for (coin, reason) in &plan.skipped_actions {
            warn!(coin = %coin, reason = %reason, "fast loop: spot buy skipped by funding planner");
            actions.retain(|a| !(a.kind == ActionKind::Buy && a.market_type == MarketType::Spot && &a.coin == coin));
        }
        for transfer in plan.inserted_transfers {
            info!(usdc_amount = %transfer.usdc_amount, to_perp = transfer.to_perp, "fast loop: funding planner inserted transfer");
            actions.insert(0, Action {
                kind: ActionKind::Transfer,
                coin: String::new(),
                market_type: if transfer.to_perp { MarketType::Perp } else { MarketType::Spot },
                size: Some(transfer.usdc_amount),
                price: None,
            });
        }
    }

    async fn remember_candles(&self, bundle: &SignalBundle) {
        if let Some(candles) = bundle.candles.as_ref().and_then(|f| f.value()) {
            if !candles.is_empty() {
                *self.candle_history.lock().await = candles.clone();
            }
        }
    }

    /// Forces `event-risk` (skipping the oracle entirely) inside the macro
    /// event lock window; otherwise calls the oracle. `None` means the
    /// oracle call failed and the caller must leave regime state untouched.
    async fn classify(
        &self,
        now: DateTime<Utc>,
        regime_signals: &crate::domain::signals::RegimeSignals,
        calendar: &[MacroEvent],
    ) -> Option<RegimeClassification> {
        let locked_event = {
            let detector = self.regime_detector.lock().await;
            detector.is_in_event_lock_window(now, calendar).cloned()
        };

        let oracle_result = if locked_event.is_none() {
            match self.oracle.classify_regime(regime_signals).await {
                Ok(result) => Some(result.classification),
                Err(err) => {
                    error!(error = %err, "regime classification call failed");
                    return None;
                }
            }
        } else {
            None
        };

        let detector = self.regime_detector.lock().await;
        Some(detector.classify_regime(now, regime_signals, calendar, || {
            oracle_result.expect("oracle result present whenever not inside the event lock window")
        }))
    }
}

/// Proportionally reduces every allocation's target percentage by
/// `reduction_pct`, the `CUT_SIZE_TO_FLOOR` tripwire response.
fn floor_allocations(allocations: &[TargetAllocation], reduction_pct: Decimal) -> Vec<TargetAllocation> {
    let keep = (Decimal::from(100) - reduction_pct).max(Decimal::ZERO) / Decimal::from(100);
    allocations
        .iter()
        .map(|allocation| {
            let mut reduced = allocation.clone();
            reduced.target_pct = (allocation.target_pct * keep).max(Decimal::ZERO);
            reduced
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn floor_allocations_reduces_every_target_proportionally() {
        let allocations = vec![
            TargetAllocation { coin: "BTC".into(), target_pct: dec!(40), market_type: crate::domain::plan::MarketType::Perp, leverage: Decimal::ONE },
            TargetAllocation { coin: "ETH".into(), target_pct: dec!(20), market_type: crate::domain::plan::MarketType::Perp, leverage: Decimal::ONE },
        ];
        let reduced = floor_allocations(&allocations, dec!(50));
        assert_eq!(reduced[0].target_pct, dec!(20));
        assert_eq!(reduced[1].target_pct, dec!(10));
    }

    #[test]
    fn floor_allocations_never_goes_negative_past_full_reduction() {
        let allocations = vec![TargetAllocation { coin: "BTC".into(), target_pct: dec!(40), market_type: crate::domain::plan::MarketType::Perp, leverage: Decimal::ONE }];
        let reduced = floor_allocations(&allocations, dec!(150));
        assert_eq!(reduced[0].target_pct, Decimal::ZERO);
    }
}
