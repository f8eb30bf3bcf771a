use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::recipe::Risk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartRequired {
    Session,
    Service,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    RepoSetup,
    Packages,
    Tool,
    PostInstall,
    Verify,
    Source,
    Build,
    Install,
    Cleanup,
    Download,
    Service,
    Config,
    ShellConfig,
    Notification,
    GithubRelease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub label: String,
    pub command: Vec<String>,
    pub needs_sudo: bool,
    pub risk: Risk,
    #[serde(default)]
    pub condition: Option<crate::recipe::Condition>,
    #[serde(default)]
    pub rollback: Option<Vec<String>>,
    #[serde(default)]
    pub restart_required: Option<RestartRequired>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub backup_before: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub post_env: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
    /// The install method this step's command was resolved from, when the
    /// step came out of method selection (tool/packages steps). `None` for
    /// steps with no method concept (repo setup, verify, post-install).
    /// Threaded into remediation so a failure consults that method's
    /// family handlers instead of only the recipe/infra/bootstrap layers.
    #[serde(default)]
    pub method: Option<crate::recipe::MethodKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationGate {
    None,
    Single,
    Double,
}

impl ConfirmationGate {
    pub fn for_risk(level: Risk) -> ConfirmationGate {
        match level {
            Risk::Low => ConfirmationGate::None,
            Risk::Medium => ConfirmationGate::Single,
            Risk::High => ConfirmationGate::Double,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSummary {
    pub level: Risk,
}

impl RiskSummary {
    pub fn from_steps(steps: &[Step]) -> RiskSummary {
        let level = steps.iter().map(|s| s.risk).max().unwrap_or(Risk::Low);
        RiskSummary { level }
    }
}

/// Steps in reverse-execution order, each carrying its undo command (or a
/// note that it is manual-rollback-only — kernel/driver-affecting steps).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RollbackPlan {
    pub steps: Vec<RollbackStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStep {
    pub step_id: String,
    pub command: Option<Vec<String>>,
    pub manual_only: bool,
}

/// Plan-build error kinds (spec.md §4.6 "Error cases" / §7 taxonomy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanError {
    NoRecipe,
    NoMethodAvailable,
    ConstraintUnsatisfiable { missing: Vec<String> },
    Cycle { tool_ids: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tool: String,
    pub label: String,
    pub already_installed: bool,
    #[serde(default)]
    pub error: Option<PlanError>,
    #[serde(default)]
    pub available_methods: Vec<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
    pub needs_sudo: bool,
    pub steps: Vec<Step>,
    pub risk_summary: RiskSummary,
    #[serde(default)]
    pub risk_escalation: Option<String>,
    pub confirmation_gate: ConfirmationGate,
    #[serde(default)]
    pub warning: Option<String>,
    #[serde(default)]
    pub rollback_plan: Option<RollbackPlan>,
}

impl Plan {
    pub fn already_installed(tool: &str, label: &str) -> Plan {
        Plan {
            tool: tool.to_string(),
            label: label.to_string(),
            already_installed: true,
            error: None,
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

    pub fn errored(tool: &str, error: PlanError) -> Plan {
        Plan {
            tool: tool.to_string(),
            label: tool.to_string(),
            already_installed: false,
            error: Some(error),
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
}

/// A user's answer to a recipe's choice/input prompts, passed into
/// `resolve_install_plan_with_choices`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Answers {
    pub choices: BTreeMap<String, ChoiceAnswer>,
    pub inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChoiceAnswer {
    Single(String),
    Multi(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(risk: Risk) -> Step {
        Step {
            id: "s".to_string(),
            step_type: StepType::Tool,
            label: "s".to_string(),
            command: vec!["true".to_string()],
            needs_sudo: false,
            risk,
            condition: None,
            rollback: None,
            restart_required: None,
            depends_on: Vec::new(),
            backup_before: Vec::new(),
            timeout_seconds: None,
            post_env: None,
            sensitive: false,
            method: None,
        }
    }

    #[test]
    fn risk_summary_takes_the_max_of_all_steps() {
        let steps = vec![step(Risk::Low), step(Risk::High), step(Risk::Medium)];
        assert_eq!(RiskSummary::from_steps(&steps).level, Risk::High);
    }

    #[test]
    fn risk_summary_of_empty_plan_is_low() {
        assert_eq!(RiskSummary::from_steps(&[]).level, Risk::Low);
    }

    #[test]
    fn confirmation_gate_is_none_iff_all_steps_low() {
        assert_eq!(ConfirmationGate::for_risk(Risk::Low), ConfirmationGate::None);
        assert_eq!(
            ConfirmationGate::for_risk(Risk::Medium),
            ConfirmationGate::Single
        );
        assert_eq!(
            ConfirmationGate::for_risk(Risk::High),
            ConfirmationGate::Double
        );
    }

    #[test]
    fn risk_ordering_is_low_lt_medium_lt_high() {
        assert!(Risk::Low < Risk::Medium);
        assert!(Risk::Medium < Risk::High);
    }
}
