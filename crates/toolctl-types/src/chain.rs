use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Pending,
    Executing,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainFrame {
    pub depth: u32,
    pub failure_id: String,
    pub chosen_option_id: String,
    #[serde(default)]
    pub plan: Option<Plan>,
    pub status: FrameStatus,
    #[serde(default)]
    pub breadcrumbs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalGoal {
    pub tool_id: String,
    pub plan: Plan,
    pub failed_step_idx: usize,
}

/// A persistable stack of remediation frames representing a
/// fix-this-to-fix-that chain. Children never point at parents by reference,
/// only by `chain_id` + `depth`; the stack is the only structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationChain {
    pub chain_id: String,
    pub original_goal: OriginalGoal,
    pub stack: Vec<ChainFrame>,
    pub max_depth: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscalationChain {
    pub const DEFAULT_MAX_DEPTH: u32 = 3;

    pub fn new(chain_id: String, original_goal: OriginalGoal) -> EscalationChain {
        let now = Utc::now();
        EscalationChain {
            chain_id,
            original_goal,
            stack: Vec::new(),
            max_depth: EscalationChain::DEFAULT_MAX_DEPTH,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_at_capacity(&self) -> bool {
        self.stack.len() as u32 >= self.max_depth
    }

    /// A `tool_id` already appearing in any frame of the stack cannot appear
    /// again (cycle check against `chosen_option_id`'s `dep`, tracked by the
    /// caller via `frame_tool_ids`).
    pub fn contains_tool(&self, tool_id: &str, frame_tool_ids: &[Option<String>]) -> bool {
        frame_tool_ids
            .iter()
            .take(self.stack.len())
            .any(|t| t.as_deref() == Some(tool_id))
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            chain_id: Some(self.chain_id.clone()),
            depth: self.stack.len() as u32,
            max_depth: self.max_depth,
            breadcrumbs: self
                .stack
                .last()
                .map(|f| f.breadcrumbs.clone())
                .unwrap_or_default(),
        }
    }
}

/// The chain summary embedded in a `RemediationResponse`; `chain_id` is
/// `None` until the first escalation actually creates a persisted chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSummary {
    pub chain_id: Option<String>,
    pub depth: u32,
    pub max_depth: u32,
    pub breadcrumbs: Vec<String>,
}

impl ChainSummary {
    pub fn none() -> ChainSummary {
        ChainSummary {
            chain_id: None,
            depth: 0,
            max_depth: EscalationChain::DEFAULT_MAX_DEPTH,
            breadcrumbs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRecordSummary {
    pub chain_id: String,
    pub tool_id: String,
    pub depth: u32,
    pub status: FrameStatus,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ConfirmationGate, PlanError, RiskSummary};
    use crate::recipe::Risk;

    fn dummy_plan() -> Plan {
        Plan {
            tool: "cargo-audit".to_string(),
            label: "cargo-audit".to_string(),
            already_installed: false,
            error: None::<PlanError>,
            available_methods: Vec::new(),
            suggestion: None,
            needs_sudo: false,
            steps: Vec::new(),
            risk_summary: RiskSummary { level: Risk::Low },
            risk_escalation: None,
            confirmation_gate: ConfirmationGate::None,
            warning: None,
            rollback_plan: None,
        }
    }

    #[test]
    fn chain_capacity_respects_max_depth() {
        let mut chain = EscalationChain::new(
            "c1".to_string(),
            OriginalGoal {
                tool_id: "cargo-audit".to_string(),
                plan: dummy_plan(),
                failed_step_idx: 0,
            },
        );
        assert!(!chain.is_at_capacity());
        for depth in 0..chain.max_depth {
            chain.stack.push(ChainFrame {
                depth,
                failure_id: "f".to_string(),
                chosen_option_id: "o".to_string(),
                plan: None,
                status: FrameStatus::Pending,
                breadcrumbs: Vec::new(),
            });
        }
        assert!(chain.is_at_capacity());
    }
}
