//! Backend health and collection status

use chrono::{DateTime, Utc};
use scoperag_common::scope::{ScopeSelector, SourceType};
use serde::Serialize;

/// Reachability and data state of one scope's backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Reachable and every source has data
    Up,
    /// Reachable, but some source has no usable collection
    Degraded,
    /// Not reachable
    Down,
}

/// Service-wide health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateHealth {
    Ok,
    Degraded,
    Down,
}

impl AggregateHealth {
    /// All up is ok, all down is down, anything else is degraded
    pub fn from_states(states: impl IntoIterator<Item = HealthState>) -> Self {
        let states: Vec<HealthState> = states.into_iter().collect();
        if states.is_empty() || states.iter().all(|s| *s == HealthState::Down) {
            AggregateHealth::Down
        } else if states.iter().all(|s| *s == HealthState::Up) {
            AggregateHealth::Ok
        } else {
            AggregateHealth::Degraded
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateHealth::Ok => "ok",
            AggregateHealth::Degraded => "degraded",
            AggregateHealth::Down => "down",
        }
    }
}

/// Collection state for one source within a scope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub source: SourceType,

    /// Canonical collection name
    pub primary_collection: String,

    /// Collection a search would read from right now
    pub resolved_collection: Option<String>,

    pub exists: bool,

    pub points: u64,

    pub dimension: Option<usize>,

    /// True when the resolved collection is a legacy name
    pub fallback_used: bool,
}

/// Health of one scope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeStatus {
    pub scope: ScopeSelector,

    pub endpoint: String,

    pub state: HealthState,

    pub reachable: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub sources: Vec<SourceStatus>,

    pub checked_at: DateTime<Utc>,
}

/// A search redirected from an unreachable scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackEvent {
    pub fallback_from: ScopeSelector,

    pub fallback_to: ScopeSelector,

    pub at: DateTime<Utc>,
}

impl FallbackEvent {
    pub fn new(from: ScopeSelector, to: ScopeSelector) -> Self {
        Self {
            fallback_from: from,
            fallback_to: to,
            at: Utc::now(),
        }
    }
}

/// Health of every configured scope
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub status: AggregateHealth,

    pub scopes: Vec<ScopeStatus>,

    /// Most recent scope fallback since startup
    pub last_fallback: Option<FallbackEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_health() {
        use HealthState::*;
        assert_eq!(AggregateHealth::from_states([Up, Up]), AggregateHealth::Ok);
        assert_eq!(AggregateHealth::from_states([Up, Down]), AggregateHealth::Degraded);
        assert_eq!(AggregateHealth::from_states([Degraded, Up]), AggregateHealth::Degraded);
        assert_eq!(AggregateHealth::from_states([Down, Down]), AggregateHealth::Down);
        assert_eq!(AggregateHealth::from_states([]), AggregateHealth::Down);
    }

    #[test]
    fn test_fallback_event_serializes_direction() {
        let event = FallbackEvent::new(ScopeSelector::Dept, ScopeSelector::Personal);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["fallback_from"], "dept");
        assert_eq!(json["fallback_to"], "personal");
    }
}
