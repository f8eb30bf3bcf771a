use serde::{Deserialize, Serialize};

use crate::chain::ChainSummary;
use crate::recipe::{FailureCategory, Risk, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Ready,
    Locked,
    Impossible,
}

/// A remediation option with its availability computed against the current
/// profile. `unlock_deps` is non-empty whenever `availability == Locked` for
/// an `install_dep`/`install_dep_then_switch` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationOption {
    pub id: String,
    pub label: String,
    pub description: String,
    pub strategy: Strategy,
    pub recommended: bool,
    pub risk: Option<Risk>,
    pub availability: Availability,
    #[serde(default)]
    pub unlock_deps: Vec<String>,
    #[serde(default)]
    pub source_layer: RemediationLayer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationLayer {
    #[default]
    Recipe,
    MethodFamily,
    Infra,
    Bootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    Retry,
    Skip,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub failure_id: String,
    pub category: FailureCategory,
    pub label: String,
    pub description: String,
    pub matched_layer: RemediationLayer,
    pub matched_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationResponse {
    pub ok: bool,
    pub tool_id: String,
    pub step_idx: usize,
    pub step_label: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub failure: FailureInfo,
    pub options: Vec<RemediationOption>,
    pub chain: ChainSummary,
    pub fallback_actions: Vec<FallbackAction>,
}

impl RemediationResponse {
    pub const FALLBACK_ACTIONS: [FallbackAction; 3] = [
        FallbackAction::Retry,
        FallbackAction::Skip,
        FallbackAction::Cancel,
    ];
}
