//! C9 Chain Store: crash-safe persistence for paused plans and escalation
//! chains. One record per id, written with the teacher's write-then-rename
//! pattern (`shipper::state::atomic_write_json`) so a reader never observes
//! a half-written file.
//!
//! Fields marked `sensitive` on a [`Step`] are redacted before any record
//! touches disk — the in-memory chain the caller holds is never mutated.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use toolctl_types::chain::{ChainRecordSummary, EscalationChain, FrameStatus};
use toolctl_types::event::PauseReason;
use toolctl_types::plan::Plan;

const REDACTED: &str = "***REDACTED***";

fn redact_plan(mut plan: Plan) -> Plan {
    for step in &mut plan.steps {
        if step.sensitive {
            step.command = vec![REDACTED.to_string()];
        }
    }
    plan
}

fn redact_chain(mut chain: EscalationChain) -> EscalationChain {
    chain.original_goal.plan = redact_plan(chain.original_goal.plan);
    for frame in &mut chain.stack {
        if let Some(plan) = frame.plan.take() {
            frame.plan = Some(redact_plan(plan));
        }
    }
    chain
}

/// A paused plan's resume point: spec.md §3.3's `restart_required` pause
/// points and §6.3's generic "plan-state record".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanState {
    pub state_id: String,
    pub tool_id: String,
    pub plan: Plan,
    pub current_step: usize,
    pub pause_reason: PauseReason,
    pub updated_at: chrono::DateTime<Utc>,
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("serializing record")?;
    {
        let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(&data).with_context(|| format!("writing {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Persistence for chain records and plan-state records, one JSON file per
/// id under `<root>/chains/` and `<root>/plans/` respectively.
#[derive(Debug, Clone)]
pub struct ChainStore {
    root: PathBuf,
}

impl ChainStore {
    pub fn new(root: impl Into<PathBuf>) -> ChainStore {
        ChainStore { root: root.into() }
    }

    fn chain_path(&self, chain_id: &str) -> PathBuf {
        self.root.join("chains").join(format!("{chain_id}.json"))
    }

    fn archived_chain_path(&self, chain_id: &str) -> PathBuf {
        self.root.join("chains").join("archived").join(format!("{chain_id}.json"))
    }

    fn plan_state_path(&self, state_id: &str) -> PathBuf {
        self.root.join("plans").join(format!("{state_id}.json"))
    }

    pub fn save_chain(&self, chain: &EscalationChain) -> Result<()> {
        let redacted = redact_chain(chain.clone());
        atomic_write_json(&self.chain_path(&chain.chain_id), &redacted)
    }

    pub fn load_chain(&self, chain_id: &str) -> Result<Option<EscalationChain>> {
        read_json(&self.chain_path(chain_id))
    }

    /// Chains whose last frame (or the chain itself, if empty) has not
    /// reached a terminal status (spec.md §4.9 `list_pending_chains`).
    pub fn list_pending_chains(&self) -> Result<Vec<ChainRecordSummary>> {
        let dir = self.root.join("chains");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(chain): Option<EscalationChain> = read_json(&path)? else { continue };
            let status = chain.stack.last().map(|f| f.status).unwrap_or(FrameStatus::Pending);
            if matches!(status, FrameStatus::Done | FrameStatus::Cancelled) {
                continue;
            }
            summaries.push(ChainRecordSummary {
                chain_id: chain.chain_id.clone(),
                tool_id: chain.original_goal.tool_id.clone(),
                depth: chain.stack.len() as u32,
                status,
                updated_at: chain.updated_at,
            });
        }
        Ok(summaries)
    }

    /// Marks every non-terminal frame `Cancelled` and persists. A chain with
    /// an empty stack is cancelled by writing a single terminal marker frame
    /// is unnecessary — cancellation of an empty chain is a no-op beyond the
    /// timestamp bump, since there is nothing pending to mark.
    pub fn cancel_chain(&self, chain_id: &str) -> Result<()> {
        let Some(mut chain) = self.load_chain(chain_id)? else {
            return Ok(());
        };
        for frame in &mut chain.stack {
            if !matches!(frame.status, FrameStatus::Done | FrameStatus::Cancelled) {
                frame.status = FrameStatus::Cancelled;
            }
        }
        chain.updated_at = Utc::now();
        self.save_chain(&chain)
    }

    /// Moves a completed chain's record out of the active set.
    pub fn archive_chain(&self, chain_id: &str) -> Result<()> {
        let src = self.chain_path(chain_id);
        if !src.exists() {
            return Ok(());
        }
        let dst = self.archived_chain_path(chain_id);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::rename(&src, &dst).with_context(|| format!("archiving {chain_id}"))
    }

    pub fn save_plan_state(&self, state: &PlanState) -> Result<()> {
        let mut redacted = state.clone();
        redacted.plan = redact_plan(redacted.plan);
        atomic_write_json(&self.plan_state_path(&state.state_id), &redacted)
    }

    pub fn load_plan_state(&self, state_id: &str) -> Result<Option<PlanState>> {
        read_json(&self.plan_state_path(state_id))
    }

    pub fn clear_plan_state(&self, state_id: &str) -> Result<()> {
        let path = self.plan_state_path(state_id);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolctl_types::chain::{ChainFrame, OriginalGoal};

    fn dummy_plan() -> Plan {
        Plan::already_installed("ruff", "ruff")
    }

    fn dummy_chain(id: &str) -> EscalationChain {
        EscalationChain::new(
            id.to_string(),
            OriginalGoal { tool_id: "ruff".to_string(), plan: dummy_plan(), failed_step_idx: 0 },
        )
    }

    #[test]
    fn save_then_load_round_trips_the_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChainStore::new(dir.path());
        let chain = dummy_chain("c1");
        store.save_chain(&chain).expect("save");
        let loaded = store.load_chain("c1").expect("load").expect("present");
        assert_eq!(loaded.chain_id, "c1");
    }

    #[test]
    fn load_missing_chain_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChainStore::new(dir.path());
        assert!(store.load_chain("missing").expect("load ok").is_none());
    }

    #[test]
    fn pending_chains_excludes_done_and_cancelled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChainStore::new(dir.path());

        let mut pending = dummy_chain("pending");
        pending.stack.push(ChainFrame {
            depth: 0,
            failure_id: "f".to_string(),
            chosen_option_id: "o".to_string(),
            plan: None,
            status: FrameStatus::Executing,
            breadcrumbs: Vec::new(),
        });
        store.save_chain(&pending).expect("save pending");

        let mut done = dummy_chain("done");
        done.stack.push(ChainFrame {
            depth: 0,
            failure_id: "f".to_string(),
            chosen_option_id: "o".to_string(),
            plan: None,
            status: FrameStatus::Done,
            breadcrumbs: Vec::new(),
        });
        store.save_chain(&done).expect("save done");

        let summaries = store.list_pending_chains().expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].chain_id, "pending");
    }

    #[test]
    fn cancel_marks_non_terminal_frames_cancelled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChainStore::new(dir.path());
        let mut chain = dummy_chain("c1");
        chain.stack.push(ChainFrame {
            depth: 0,
            failure_id: "f".to_string(),
            chosen_option_id: "o".to_string(),
            plan: None,
            status: FrameStatus::Pending,
            breadcrumbs: Vec::new(),
        });
        store.save_chain(&chain).expect("save");
        store.cancel_chain("c1").expect("cancel");
        let loaded = store.load_chain("c1").expect("load").expect("present");
        assert_eq!(loaded.stack[0].status, FrameStatus::Cancelled);
    }

    #[test]
    fn sensitive_step_command_is_redacted_at_rest() {
        use toolctl_types::plan::{ConfirmationGate, RiskSummary, Step, StepType};
        use toolctl_types::recipe::Risk;

        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChainStore::new(dir.path());
        let mut plan = dummy_plan();
        plan.already_installed = false;
        plan.steps.push(Step {
            id: "s1".to_string(),
            step_type: StepType::Config,
            label: "write token".to_string(),
            command: vec!["echo".to_string(), "hunter2".to_string()],
            needs_sudo: false,
            risk: Risk::Low,
            condition: None,
            rollback: None,
            restart_required: None,
            depends_on: Vec::new(),
            backup_before: Vec::new(),
            timeout_seconds: None,
            post_env: None,
            sensitive: true,
            method: None,
        });
        plan.risk_summary = RiskSummary::from_steps(&plan.steps);
        plan.confirmation_gate = ConfirmationGate::for_risk(plan.risk_summary.level);

        let state = PlanState {
            state_id: "s1".to_string(),
            tool_id: "ruff".to_string(),
            plan,
            current_step: 0,
            pause_reason: PauseReason::RestartRequired,
            updated_at: Utc::now(),
        };
        store.save_plan_state(&state).expect("save");
        let loaded = store.load_plan_state("s1").expect("load").expect("present");
        assert_eq!(loaded.plan.steps[0].command, vec![REDACTED.to_string()]);
    }

    #[test]
    fn archive_moves_the_chain_out_of_the_active_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChainStore::new(dir.path());
        store.save_chain(&dummy_chain("c1")).expect("save");
        store.archive_chain("c1").expect("archive");
        assert!(store.load_chain("c1").expect("load").is_none());
        assert!(store.archived_chain_path("c1").exists());
    }
}
