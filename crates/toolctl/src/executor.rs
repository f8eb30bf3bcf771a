//! C7 Executor: runs a resolved plan's steps, honoring sudo, conditions,
//! timeouts, and `restart_required` pause points, while streaming a finite,
//! restartable sequence of [`Event`]s.
//!
//! There is no async runtime in this crate (mirroring the teacher, which
//! drives its own execution loop on plain threads): `execute` returns the
//! whole `Vec<Event>` for one invocation rather than a live stream. A caller
//! wanting incremental delivery reads events off the returned vector as they
//! would off a channel; resuming after a pause is just calling `execute`
//! again with `start_from` set past the persisted step.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use toolctl_types::event::{Event, PauseReason, StepDone};
use toolctl_types::plan::Plan;
use toolctl_types::profile::HostProfile;
use toolctl_types::recipe::{Condition, Risk};

use crate::chain_store::{ChainStore, PlanState};
use crate::recipes::RecipeStore;
use crate::remediation;

const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Steps whose command invokes the same package-manager family share a
/// mutex (spec.md §5 "shared-resource policy") so concurrent installs never
/// race on the PM's lock file. This crate executes steps sequentially by
/// default, so the mutex only matters once a caller builds a DAG plan with
/// genuinely parallel dispatch; it is held here regardless, so that adding
/// parallel dispatch later doesn't silently drop the safety property.
static PM_MUTEXES: OnceLock<Mutex<BTreeMap<&'static str, Mutex<()>>>> = OnceLock::new();

fn pm_family(command: &[String]) -> Option<&'static str> {
    let program = command.first()?.as_str();
    Some(match program {
        "apt-get" | "apt" => "apt",
        "dnf" => "dnf",
        "yum" => "yum",
        "rpm" => "rpm",
        "zypper" => "zypper",
        "apk" => "apk",
        "pacman" => "pacman",
        "brew" => "brew",
        "snap" => "snap",
        _ => return None,
    })
}

fn with_pm_lock<T>(command: &[String], f: impl FnOnce() -> T) -> T {
    let Some(family) = pm_family(command) else { return f() };
    let registry = PM_MUTEXES.get_or_init(|| Mutex::new(BTreeMap::new()));
    let family_mutex = {
        let mut guard = registry.lock().expect("pm mutex registry poisoned");
        if !guard.contains_key(family) {
            guard.insert(family, Mutex::new(()));
        }
        // SAFETY-free: we only ever read through the registry lock to reach
        // the per-family lock, never hold both at once past this block.
        guard.get(family).map(|_| ()).unwrap();
        family
    };
    let guard = registry.lock().expect("pm mutex registry poisoned");
    let lock = guard.get(family_mutex).expect("family mutex just inserted");
    let _held = lock.lock().expect("pm family mutex poisoned");
    drop(guard);
    f()
}

#[derive(Debug, Default)]
pub struct ExecutionContext {
    pub sudo_password: Option<String>,
    pub dry_run: bool,
    pub timeout_override: Option<Duration>,
}

/// Runs one command, honoring `needs_sudo` and the execution context's
/// sudo password. `sudo -k` always precedes a sudo invocation so a stale
/// cached credential never silently satisfies a password prompt.
fn run_step_command(
    command: &[String],
    needs_sudo: bool,
    is_root: bool,
    ctx: &ExecutionContext,
    timeout: Duration,
) -> (bool, Option<i32>, String) {
    if command.is_empty() {
        return (true, Some(0), String::new());
    }

    let mut argv = command.to_vec();
    let mut use_stdin_password = false;
    if needs_sudo && !is_root {
        let _ = Command::new("sudo").arg("-k").output();
        argv.insert(0, "-S".to_string());
        argv.insert(0, "sudo".to_string());
        use_stdin_password = ctx.sudo_password.is_some();
    } else if needs_sudo && is_root {
        // already root: drop a leading literal `sudo` token if the recipe baked one in
        if argv.first().map(String::as_str) == Some("sudo") {
            argv.remove(0);
        }
    }

    let (tx, rx) = std::sync::mpsc::channel();
    let password = ctx.sudo_password.clone();
    let spawn_argv = argv.clone();
    std::thread::spawn(move || {
        let mut command = Command::new(&spawn_argv[0]);
        command.args(&spawn_argv[1..]);
        if use_stdin_password {
            command.stdin(std::process::Stdio::piped());
        }
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        let result = (|| -> std::io::Result<std::process::Output> {
            let mut child = command.spawn()?;
            if use_stdin_password {
                use std::io::Write;
                if let (Some(stdin), Some(pw)) = (child.stdin.as_mut(), password.as_deref()) {
                    let _ = writeln!(stdin, "{pw}");
                }
            }
            child.wait_with_output()
        })();
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            (output.status.success(), output.status.code(), stderr)
        }
        Ok(Err(e)) => (false, None, format!("failed to spawn step: {e}")),
        Err(_) => (false, None, "timed out".to_string()),
    }
}

fn condition_holds(condition: &Option<Condition>, profile: &HostProfile) -> bool {
    let Some(condition) = condition else { return true };
    match condition {
        Condition::HasSystemd => profile.fast.capabilities.has_systemd,
        Condition::HasOpenrc => profile.deep.init_system.as_deref() == Some("openrc"),
        Condition::NotRoot => !profile.fast.capabilities.is_root,
        Condition::IsRoot => profile.fast.capabilities.is_root,
        Condition::NotContainer => !profile.fast.container.in_container,
        Condition::HasDocker => profile.deep.services.get("docker").copied().unwrap_or(false),
        Condition::FileExists { path } => std::path::Path::new(path).exists(),
    }
}

fn backup_path(original: &str) -> String {
    format!("{original}.bak.{}", chrono::Utc::now().timestamp())
}

/// `execute(plan, sudo_password?, start_from, profile) → stream<Event>`
/// (spec.md §4.7). Returns the whole finite event sequence for this
/// invocation; a `PlanPaused` event is always the last one when execution
/// stops early (restart point, remediation pause, or cancellation).
///
/// `chain_store`, when supplied, receives a persisted [`PlanState`] *before*
/// any high-risk step runs and *before* any `restart_required` step runs —
/// the pause point must survive a crash mid-step, not just a clean stop.
pub fn execute(
    plan: &Plan,
    ctx: &ExecutionContext,
    start_from: usize,
    profile: &HostProfile,
    store: &RecipeStore,
    chain_store: Option<&ChainStore>,
) -> Vec<Event> {
    let mut events = Vec::new();
    let state_id = crate::resolver::plan_builder::compute_plan_id(plan);

    let persist = |current_step: usize, reason: PauseReason| {
        if let Some(chain_store) = chain_store {
            let state = PlanState {
                state_id: state_id.clone(),
                tool_id: plan.tool.clone(),
                plan: plan.clone(),
                current_step,
                pause_reason: reason,
                updated_at: chrono::Utc::now(),
            };
            if let Err(e) = chain_store.save_plan_state(&state) {
                tracing::warn!(error = %e, "failed to persist plan state");
            }
        }
    };

    for (idx, step) in plan.steps.iter().enumerate().skip(start_from) {
        if !condition_holds(&step.condition, profile) {
            tracing::debug!(step = %step.id, "condition not met, skipping");
            continue;
        }

        if step.risk == Risk::High || step.restart_required.is_some() {
            persist(idx, PauseReason::RestartRequired);
        }

        events.push(Event::StepStart { step_id: step.id.clone() });

        if !step.backup_before.is_empty() {
            let mut backup_failed = false;
            for path in &step.backup_before {
                if std::path::Path::new(path).exists() {
                    if let Err(e) = std::fs::copy(path, backup_path(path)) {
                        tracing::warn!(path, error = %e, "backup before high-risk step failed");
                        backup_failed = true;
                        break;
                    }
                }
            }
            if backup_failed {
                events.push(Event::StepDone {
                    step_id: step.id.clone(),
                    result: StepDone { ok: false, exit_code: None, stderr: "backup failed, aborting step".to_string() },
                });
                events.push(Event::PlanPaused {
                    reason: PauseReason::Cancelled,
                    state_id: state_id.clone(),
                });
                return events;
            }
        }

        let timeout = step
            .timeout_seconds
            .map(Duration::from_secs)
            .or(ctx.timeout_override)
            .unwrap_or(DEFAULT_INSTALL_TIMEOUT);

        let (ok, exit_code, stderr) = if ctx.dry_run {
            tracing::info!(step = %step.id, command = ?step.command, "dry run, not executing");
            (true, Some(0), String::new())
        } else {
            with_pm_lock(&step.command, || {
                run_step_command(&step.command, step.needs_sudo, profile.fast.capabilities.is_root, ctx, timeout)
            })
        };

        events.push(Event::StepDone {
            step_id: step.id.clone(),
            result: StepDone { ok, exit_code, stderr: stderr.clone() },
        });

        if !ok {
            let method = step.method.unwrap_or(toolctl_types::recipe::MethodKey::Default);
            let response = remediation::analyse_failure(
                &plan.tool,
                idx,
                &step.label,
                &stderr,
                exit_code,
                method,
                profile,
                store,
                None,
            );
            events.push(Event::Remediation { response: Box::new(response) });
            return events;
        }

        if let Some(restart) = step.restart_required {
            events.push(Event::PlanPaused {
                reason: PauseReason::RestartRequired,
                state_id: state_id.clone(),
            });
            tracing::info!(step = %step.id, ?restart, "plan paused for restart");
            return events;
        }
    }

    events.push(Event::PlanDone { ok: true });
    events
}

/// Resumes a persisted [`PlanState`], recomputing a fresh plan against the
/// *current* profile first and diffing it against the persisted one
/// (spec.md SPEC_FULL "Plan diffing for resume"). A drift emits a single
/// `PlanDrift` warning event before execution continues from
/// `state.current_step` — this never blocks the resume, it only surfaces
/// that the host changed underneath a paused plan.
///
/// Drift detection is skipped (silently) when the persisted plan's tool has
/// `choices`, since `resolve_install_plan` errors on those and the original
/// answers aren't retained in `PlanState` — there is nothing comparable to
/// recompute without them.
pub fn execute_resume(
    state: &crate::chain_store::PlanState,
    ctx: &ExecutionContext,
    profile: &HostProfile,
    store: &RecipeStore,
    chain_store: Option<&ChainStore>,
) -> Vec<Event> {
    let mut events = Vec::new();
    let fresh = crate::resolver::plan_builder::resolve_install_plan(&state.tool_id, profile, store);
    if fresh.error.is_none() {
        if let Some(message) = crate::resolver::plan_builder::diff_for_resume(&state.plan, &fresh) {
            tracing::warn!(tool = %state.tool_id, %message, "resumed plan drifted from current profile");
            events.push(Event::PlanDrift { state_id: state.state_id.clone(), message });
        }
    }
    events.extend(execute(&state.plan, ctx, state.current_step, profile, store, chain_store));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolctl_types::plan::{ConfirmationGate, RiskSummary};
    use toolctl_types::plan::{Step, StepType};
    use toolctl_types::recipe::Risk;

    fn plan_with_steps(steps: Vec<Step>) -> Plan {
        Plan {
            tool: "t".to_string(),
            label: "t".to_string(),
            already_installed: false,
            error: None,
            available_methods: Vec::new(),
            suggestion: None,
            needs_sudo: false,
            steps,
            risk_summary: RiskSummary { level: Risk::Low },
            risk_escalation: None,
            confirmation_gate: ConfirmationGate::None,
            warning: None,
            rollback_plan: None,
        }
    }

    fn step(id: &str, command: Vec<&str>) -> Step {
        Step {
            id: id.to_string(),
            step_type: StepType::Tool,
            label: id.to_string(),
            command: command.into_iter().map(String::from).collect(),
            needs_sudo: false,
            risk: Risk::Low,
            condition: None,
            rollback: None,
            restart_required: None,
            depends_on: Vec::new(),
            backup_before: Vec::new(),
            timeout_seconds: Some(2),
            post_env: None,
            sensitive: false,
            method: None,
        }
    }

    #[test]
    fn dry_run_never_spawns_and_reports_success() {
        let plan = plan_with_steps(vec![step("s1", vec!["false"])]);
        let ctx = ExecutionContext { dry_run: true, ..Default::default() };
        let store = RecipeStore::default();
        let profile = HostProfile::default();
        let events = execute(&plan, &ctx, 0, &profile, &store, None);
        assert!(matches!(events.last(), Some(Event::PlanDone { ok: true })));
    }

    #[test]
    fn condition_false_skips_the_step_entirely() {
        let mut gated = step("s1", vec!["true"]);
        gated.condition = Some(Condition::HasDocker);
        let plan = plan_with_steps(vec![gated]);
        let ctx = ExecutionContext::default();
        let store = RecipeStore::default();
        let profile = HostProfile::default();
        let events = execute(&plan, &ctx, 0, &profile, &store, None);
        assert!(!events.iter().any(|e| matches!(e, Event::StepStart { .. })));
        assert!(matches!(events.last(), Some(Event::PlanDone { ok: true })));
    }

    #[test]
    fn restart_required_pauses_after_the_step_completes() {
        let mut restart_step = step("s1", vec!["true"]);
        restart_step.restart_required = Some(toolctl_types::plan::RestartRequired::System);
        let plan = plan_with_steps(vec![restart_step, step("s2", vec!["true"])]);
        let ctx = ExecutionContext::default();
        let store = RecipeStore::default();
        let profile = HostProfile::default();
        let events = execute(&plan, &ctx, 0, &profile, &store, None);
        assert!(matches!(events.last(), Some(Event::PlanPaused { reason: PauseReason::RestartRequired, .. })));
        assert!(!events.iter().any(|e| matches!(e, Event::StepStart { step_id } if step_id == "s2")));
    }

    #[test]
    fn failing_step_emits_remediation_and_stops() {
        let plan = plan_with_steps(vec![step("s1", vec!["false"])]);
        let ctx = ExecutionContext::default();
        let store = RecipeStore::default();
        let profile = HostProfile::default();
        let events = execute(&plan, &ctx, 0, &profile, &store, None);
        assert!(matches!(events.last(), Some(Event::Remediation { .. })));
    }

    #[test]
    fn failing_step_passes_its_own_method_to_remediation_not_default() {
        use toolctl_types::recipe::MethodKey;
        let mut failing = step("s1", vec!["false"]);
        failing.method = Some(MethodKey::Pip);
        let plan = plan_with_steps(vec![failing]);
        let ctx = ExecutionContext::default();
        let store = RecipeStore::default();
        let profile = HostProfile::default();
        let events = execute(&plan, &ctx, 0, &profile, &store, None);
        let Some(Event::Remediation { response }) = events.last() else {
            panic!("expected a remediation event");
        };
        assert_eq!(response.failure.matched_method.as_deref(), Some("pip"));
    }

    fn curl_store() -> RecipeStore {
        use toolctl_types::recipe::{MethodKey, Recipe, Requirements};
        let mut install = BTreeMap::new();
        install.insert(MethodKey::Default, vec!["true".to_string()]);
        let mut needs_sudo = BTreeMap::new();
        needs_sudo.insert(MethodKey::Default, false);
        let recipe = Recipe {
            tool_id: "curl".to_string(),
            label: "curl".to_string(),
            cli: None,
            category: None,
            risk: Risk::Low,
            install,
            needs_sudo,
            prefer: Vec::new(),
            requires: Requirements::default(),
            repo_setup: BTreeMap::new(),
            post_env: None,
            post_install: Vec::new(),
            verify: None,
            update: BTreeMap::new(),
            remove: BTreeMap::new(),
            choices: Vec::new(),
            install_variants: BTreeMap::new(),
            inputs: Vec::new(),
            config_templates: Vec::new(),
            shell_config: None,
            restart_required: None,
            on_failure: Vec::new(),
            arch_map: BTreeMap::new(),
        };
        let mut recipes = BTreeMap::new();
        recipes.insert("curl".to_string(), recipe);
        RecipeStore::from_recipes(recipes)
    }

    #[test]
    fn execute_resume_emits_no_drift_when_profile_is_unchanged() {
        let store = curl_store();
        let profile = HostProfile::default();
        let plan = crate::resolver::plan_builder::resolve_install_plan("curl", &profile, &store);
        let state = PlanState {
            state_id: "s1".to_string(),
            tool_id: "curl".to_string(),
            plan,
            current_step: 0,
            pause_reason: PauseReason::RestartRequired,
            updated_at: chrono::Utc::now(),
        };
        let ctx = ExecutionContext { dry_run: true, ..Default::default() };
        let events = execute_resume(&state, &ctx, &profile, &store, None);
        assert!(!events.iter().any(|e| matches!(e, Event::PlanDrift { .. })));
    }

    #[test]
    fn execute_resume_flags_drift_when_persisted_command_is_stale() {
        let store = curl_store();
        let profile = HostProfile::default();
        let mut plan = crate::resolver::plan_builder::resolve_install_plan("curl", &profile, &store);
        plan.steps[0].command = vec!["a-command-that-no-longer-matches".to_string()];
        let state = PlanState {
            state_id: "s1".to_string(),
            tool_id: "curl".to_string(),
            plan,
            current_step: 0,
            pause_reason: PauseReason::RestartRequired,
            updated_at: chrono::Utc::now(),
        };
        let ctx = ExecutionContext { dry_run: true, ..Default::default() };
        let events = execute_resume(&state, &ctx, &profile, &store, None);
        assert!(matches!(events.first(), Some(Event::PlanDrift { .. })));
    }
}
