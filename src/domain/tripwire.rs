use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    AccountSafety,
    PlanInvalidation,
    Operational,
}

impl Category {
    /// Priority order for consumer handling: account_safety > plan_invalidation > operational.
    pub fn priority(&self) -> u8 {
        match self {
            Category::AccountSafety => 0,
            Category::PlanInvalidation => 1,
            Category::Operational => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripwireAction {
    FreezeNewRisk,
    CutSizeToFloor,
    EscalateToSlowLoop,
    InvalidatePlan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripwireEvent {
    pub severity: Severity,
    pub category: Category,
    pub trigger: String,
    pub action: TripwireAction,
    pub timestamp: DateTime<Utc>,
    pub details: HashMap<String, String>,
}

impl TripwireEvent {
    /// Sort key for priority ordering: account_safety first, critical before warning.
    pub fn priority_key(&self) -> (u8, u8) {
        (self.category.priority(), if self.severity == Severity::Critical { 0 } else { 1 })
    }
}
