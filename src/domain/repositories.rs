//! Persistence-port traits. Storage-agnostic by design (the Cache contract
//! in particular — any embedded KV with TTL semantics satisfies it), mirrors
//! the teacher's `domain/repositories.rs` trait-per-aggregate shape.

use async_trait::async_trait;

use crate::domain::errors::GovernanceError;
use crate::domain::plan::PlanMetrics;

/// Persisted governor state: active plan, last change timestamp, and any
/// in-flight rebalance schedule.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
pub struct GovernorState {
    pub active_plan: Option<crate::domain::plan::StrategyPlanCard>,
    pub last_change_at: Option<chrono::DateTime<chrono::Utc>>,
    pub rebalance_schedule: Option<crate::domain::plan::RebalanceSchedule>,
}

#[async_trait]
pub trait GovernorStateRepository: Send + Sync {
    async fn load(&self) -> Result<GovernorState, GovernanceError>;
    async fn save(&self, state: &GovernorState) -> Result<(), GovernanceError>;
}

/// Append-only log of finalized plans.
#[async_trait]
pub trait CompletedPlansLog: Send + Sync {
    async fn append(&self, metrics: &PlanMetrics) -> Result<(), GovernanceError>;
}
