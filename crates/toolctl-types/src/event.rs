use serde::{Deserialize, Serialize};

use crate::remediation::RemediationResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    RestartRequired,
    AwaitingRemediationChoice,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDone {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// A single event emitted by the executor stream. Events for a given step
/// are totally ordered (`start < stdout* < stderr* < done`); events across
/// parallel steps interleave, each carrying its `step_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StepStart {
        step_id: String,
    },
    StepStdoutChunk {
        step_id: String,
        chunk: String,
    },
    StepStderrChunk {
        step_id: String,
        chunk: String,
    },
    StepDone {
        step_id: String,
        result: StepDone,
    },
    PlanPaused {
        reason: PauseReason,
        state_id: String,
    },
    PlanDone {
        ok: bool,
    },
    Remediation {
        response: Box<RemediationResponse>,
    },
    PendingChain {
        chain_id: String,
    },
    /// Emitted once, before any step resumes, when the plan recomputed
    /// against the *current* profile disagrees with the persisted plan's
    /// step identity (step id or command changed since the plan was
    /// paused). Execution still proceeds from the persisted plan — this is
    /// a warning, not a hard stop.
    PlanDrift {
        state_id: String,
        message: String,
    },
}
