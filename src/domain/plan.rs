//! The Strategy Plan Card: the central governed entity, and the scorekeeping
//! records that track its performance over its lifetime.
//!
//! Field shapes are grounded on `original_source/governance/plan_card.py`;
//! `to_dict`/`from_dict`/`to_json`/`from_json` there become plain `serde`
//! (de)serialization here rather than hand-written conversions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Perp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetAllocation {
    pub coin: String,
    pub target_pct: Decimal,
    pub market_type: MarketType,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
}

fn default_leverage() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskBudget {
    pub max_position_pct: std::collections::HashMap<String, Decimal>,
    pub max_leverage: Decimal,
    pub max_adverse_excursion_pct: Decimal,
    pub plan_max_drawdown_pct: Decimal,
    pub per_trade_risk_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    pub profit_target_pct: Option<Decimal>,
    pub stop_loss_pct: Option<Decimal>,
    pub time_based_review_hours: i64,
    /// Free-text predicates, parsed lazily at evaluation time by the
    /// tripwire grammar. Malformed entries are stored as-is and simply
    /// never fire.
    pub invalidation_triggers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangeCostModel {
    pub estimated_fees_bps: Decimal,
    pub estimated_slippage_bps: Decimal,
    pub estimated_funding_change_bps: Decimal,
    pub opportunity_cost_bps: Decimal,
}

impl ChangeCostModel {
    /// Matches the original's `@property total_cost_bps`: a computed sum,
    /// never stored, so the four components stay the single source of
    /// truth.
    pub fn total_cost_bps(&self) -> Decimal {
        self.estimated_fees_bps
            + self.estimated_slippage_bps
            + self.estimated_funding_change_bps
            + self.opportunity_cost_bps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Minutes,
    Hours,
    Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Rebalancing,
    Invalidated,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPlanCard {
    // Identity
    pub plan_id: String,
    pub strategy_name: String,
    pub strategy_version: String,
    pub created_at: DateTime<Utc>,

    // Intent
    pub objective: String,
    pub target_holding_period_hours: i64,
    pub time_horizon: TimeHorizon,
    pub key_thesis: String,

    // Targets
    pub target_allocations: Vec<TargetAllocation>,
    pub allowed_leverage_range: (Decimal, Decimal),

    // Risk
    pub risk_budget: RiskBudget,

    // Exit & review
    pub exit_rules: ExitRules,

    // Change cost
    pub change_cost: ChangeCostModel,

    // Confidence & monitoring
    pub expected_edge_bps: Decimal,
    pub kpis_to_track: Vec<String>,
    pub minimum_dwell_minutes: i64,

    // Regime compatibility
    pub compatible_regimes: Vec<String>,
    pub avoid_regimes: Vec<String>,

    // State
    pub status: PlanStatus,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub rebalance_progress_pct: Decimal,
}

impl StrategyPlanCard {
    /// Sum of `target_pct` across allocations; invariant requires this
    /// never exceed 100 (remainder is implicit cash).
    pub fn total_target_pct(&self) -> Decimal {
        self.target_allocations.iter().map(|a| a.target_pct).sum()
    }
}

/// One interpolated step in a rebalance schedule: `progress_pct` is the
/// cumulative completion after this step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceStep {
    pub progress_pct: Decimal,
    pub allocations: Vec<TargetAllocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceSchedule {
    pub from_allocations: Vec<TargetAllocation>,
    pub to_allocations: Vec<TargetAllocation>,
    pub steps: Vec<RebalanceStep>,
    pub current_step: usize,
}

/// Per-plan lifetime record updated by the Scorekeeper. Reconstructed from
/// `spec.md` §3/§4.9 (the original's `governance/scorekeeper.py` is not in
/// the retrieval pack's filtered file list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub plan_id: String,
    pub realized_pnl: Decimal,
    pub peak_portfolio_value: Decimal,
    pub max_drawdown_pct: Decimal,
    pub trade_count: u64,
    pub winning_trade_count: u64,
    pub hit_rate: Decimal,
    pub avg_slippage_bps: Decimal,
    pub avg_drift_pct: Decimal,
    pub rebalance_count: u64,
}

impl PlanMetrics {
    pub fn new(plan_id: impl Into<String>, starting_portfolio_value: Decimal) -> Self {
        PlanMetrics {
            plan_id: plan_id.into(),
            realized_pnl: Decimal::ZERO,
            peak_portfolio_value: starting_portfolio_value,
            max_drawdown_pct: Decimal::ZERO,
            trade_count: 0,
            winning_trade_count: 0,
            hit_rate: Decimal::ZERO,
            avg_slippage_bps: Decimal::ZERO,
            avg_drift_pct: Decimal::ZERO,
            rebalance_count: 0,
        }
    }
}

/// Paper-trading record for an alternative strategy, used only to compute
/// opportunity cost for the governor's change-cost model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowPortfolio {
    pub strategy_name: String,
    pub started_at: DateTime<Utc>,
    pub starting_value: Decimal,
    pub marked_value: Decimal,
}

impl ShadowPortfolio {
    pub fn pnl(&self) -> Decimal {
        self.marked_value - self.starting_value
    }
}
