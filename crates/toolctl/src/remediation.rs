//! C8 Remediation Engine: matches handler patterns against a failed step's
//! stderr+exit code across the four cascading layers (recipe, method-family,
//! infra, bootstrap), collects the union of options, computes per-option
//! availability against the current profile, and builds a response that
//! carries an escalation-chain summary.
//!
//! Layers **collect**, they never short-circuit (spec.md §4.8): every
//! handler whose pattern matches in every layer contributes its options, and
//! options are merged by id with the earliest-matching layer's copy winning
//! ties.

use std::process::Command;

use toolctl_types::chain::{ChainFrame, ChainSummary, EscalationChain, FrameStatus, OriginalGoal};
use toolctl_types::plan::Plan;
use toolctl_types::profile::HostProfile;
use toolctl_types::recipe::{
    FailureCategory, HandlerRecord, MethodKey, PackageManagerKey, PackageRef, Recipe,
    RemediationOptionRecord, Strategy,
};
use toolctl_types::remediation::{
    Availability, FailureInfo, FallbackAction, RemediationLayer, RemediationOption,
    RemediationResponse,
};

use crate::recipes::RecipeStore;
use crate::resolver::method::is_feasible;

/// A handler match, carrying which layer it came from so later merging can
/// apply "recipe wins ties" and preserve per-layer declared order.
struct Matched<'a> {
    handler: &'a HandlerRecord,
    layer: RemediationLayer,
}

fn handler_matches(handler: &HandlerRecord, stderr: &str, exit_code: Option<i32>) -> bool {
    if let Some(expected) = handler.exit_code {
        if exit_code != Some(expected) {
            return false;
        }
    }
    regex::RegexBuilder::new(&handler.pattern)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(stderr))
        .unwrap_or(false)
}

fn collect_matches<'a>(
    recipe: Option<&'a Recipe>,
    method: MethodKey,
    store: &'a RecipeStore,
    stderr: &str,
    exit_code: Option<i32>,
) -> Vec<Matched<'a>> {
    let mut matched = Vec::new();
    if let Some(recipe) = recipe {
        for handler in &recipe.on_failure {
            if handler_matches(handler, stderr, exit_code) {
                matched.push(Matched { handler, layer: RemediationLayer::Recipe });
            }
        }
    }
    for handler in store.get_method_family_handlers(method) {
        if handler_matches(handler, stderr, exit_code) {
            matched.push(Matched { handler, layer: RemediationLayer::MethodFamily });
        }
    }
    for handler in store.infra_handlers() {
        if handler_matches(handler, stderr, exit_code) {
            matched.push(Matched { handler, layer: RemediationLayer::Infra });
        }
    }
    for handler in store.bootstrap_handlers() {
        if handler_matches(handler, stderr, exit_code) {
            matched.push(Matched { handler, layer: RemediationLayer::Bootstrap });
        }
    }
    matched
}

fn method_to_pm_key(method: MethodKey) -> Option<PackageManagerKey> {
    Some(match method {
        MethodKey::Apt => PackageManagerKey::Apt,
        MethodKey::Dnf => PackageManagerKey::Dnf,
        MethodKey::Yum => PackageManagerKey::Yum,
        MethodKey::Apk => PackageManagerKey::Apk,
        MethodKey::Pacman => PackageManagerKey::Pacman,
        MethodKey::Zypper => PackageManagerKey::Zypper,
        MethodKey::Brew => PackageManagerKey::Brew,
        MethodKey::Snap | MethodKey::Pip | MethodKey::Npm | MethodKey::Cargo | MethodKey::Go
        | MethodKey::Default => return None,
    })
}

/// Runs `<dep> --version` with a short bound and pulls the first dotted
/// version token out of stdout. Best-effort, mirroring the host probe's
/// tolerance for absent/odd tool output.
fn detect_version(dep: &str) -> Option<String> {
    let output = Command::new(dep).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    text.split_whitespace()
        .find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(|tok| tok.trim_matches(|c: char| !c.is_ascii_digit() && c != '.').to_string())
}

fn compare_versions(have: &str, want: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u32> { s.split('.').filter_map(|p| p.parse().ok()).collect() };
    let (h, w) = (parse(have), parse(want));
    for i in 0..h.len().max(w.len()) {
        let a = h.get(i).copied().unwrap_or(0);
        let b = w.get(i).copied().unwrap_or(0);
        if a != b {
            return a.cmp(&b);
        }
    }
    std::cmp::Ordering::Equal
}

fn package_ref_is_satisfiable(packages: &PackageRef, profile: &HostProfile, store: &RecipeStore) -> bool {
    match packages {
        PackageRef::Explicit(map) => map.get(&profile.distro_family()).is_some_and(|pkgs| !pkgs.is_empty()),
        PackageRef::Named(name) => store
            .get_package_group(name)
            .and_then(|map| map.get(&profile.distro_family()))
            .is_some_and(|pkgs| !pkgs.is_empty()),
    }
}

/// Per spec.md §4.8 "Availability computation per option".
fn compute_availability(
    option: &RemediationOptionRecord,
    recipe: Option<&Recipe>,
    profile: &HostProfile,
    store: &RecipeStore,
) -> (Availability, Vec<String>) {
    if let Some(excluded) = &option.arch_exclude {
        if excluded.iter().any(|a| a == profile.arch()) {
            return (Availability::Impossible, Vec::new());
        }
    }

    match option.strategy {
        Strategy::InstallDep => match &option.dep {
            Some(dep) if which::which(dep).is_ok() => (Availability::Ready, Vec::new()),
            Some(dep) if store.get_recipe(dep).is_some() => (Availability::Locked, vec![dep.clone()]),
            _ => (Availability::Impossible, Vec::new()),
        },
        Strategy::InstallDepThenSwitch => match &option.dep {
            Some(dep) if which::which(dep).is_ok() => (Availability::Ready, Vec::new()),
            Some(dep) => (Availability::Locked, vec![dep.clone()]),
            None => (Availability::Impossible, Vec::new()),
        },
        Strategy::SwitchMethod => {
            let feasible = option.switch_to.is_some_and(|target| {
                recipe.is_some_and(|r| r.install.contains_key(&target)) && is_feasible(target, profile)
            });
            if feasible {
                (Availability::Ready, Vec::new())
            } else {
                (Availability::Impossible, Vec::new())
            }
        }
        Strategy::InstallPackages => match &option.packages {
            Some(packages) if package_ref_is_satisfiable(packages, profile, store) => {
                (Availability::Ready, Vec::new())
            }
            _ => (Availability::Impossible, Vec::new()),
        },
        Strategy::RetryWithModifier | Strategy::CleanupRetry | Strategy::Manual | Strategy::EnvFix => {
            (Availability::Ready, Vec::new())
        }
        Strategy::AddRepo => {
            let ready = profile
                .primary_pm()
                .and_then(method_to_pm_key)
                .is_some_and(|pm| option.repo_commands.as_ref().is_some_and(|cmds| cmds.contains_key(&pm)));
            if ready {
                (Availability::Ready, Vec::new())
            } else {
                (Availability::Impossible, Vec::new())
            }
        }
        Strategy::UpgradeDep => match (&option.dep, &option.min_version) {
            (Some(dep), Some(min)) => match detect_version(dep) {
                Some(have) if compare_versions(&have, min) != std::cmp::Ordering::Less => {
                    (Availability::Ready, Vec::new())
                }
                Some(_) => (Availability::Ready, Vec::new()),
                None if store.get_recipe(dep).is_some() => (Availability::Locked, vec![dep.clone()]),
                None => (Availability::Impossible, Vec::new()),
            },
            _ => (Availability::Impossible, Vec::new()),
        },
    }
}

fn bucket(availability: Availability) -> u8 {
    match availability {
        Availability::Ready => 0,
        Availability::Locked => 1,
        Availability::Impossible => 2,
    }
}

/// Merge options across layers by id (earliest-matching layer wins the
/// content, i.e. recipe beats method-family beats infra beats bootstrap —
/// `collect_matches` already returns layers in that priority order), then
/// sort recommended-first, then by availability bucket, preserving each
/// source layer's internal order within a bucket.
fn merge_and_order(
    matches: &[Matched<'_>],
    recipe: Option<&Recipe>,
    profile: &HostProfile,
    store: &RecipeStore,
) -> Vec<RemediationOption> {
    let mut seen = std::collections::BTreeSet::new();
    let mut merged = Vec::new();
    for m in matches {
        for option in &m.handler.options {
            if !seen.insert(option.id.clone()) {
                continue;
            }
            let (availability, unlock_deps) = compute_availability(option, recipe, profile, store);
            merged.push(RemediationOption {
                id: option.id.clone(),
                label: option.label.clone(),
                description: option.description.clone(),
                strategy: option.strategy,
                recommended: option.recommended,
                risk: option.risk,
                availability,
                unlock_deps,
                source_layer: m.layer,
            });
        }
    }
    merged.sort_by(|a, b| {
        b.recommended.cmp(&a.recommended).then_with(|| bucket(a.availability).cmp(&bucket(b.availability)))
    });
    merged
}

/// The retry/skip/cancel fallback, always appended after matched-handler
/// options so `options` is never empty (spec.md §8: "every remediation
/// response: `options` is non-empty (fallback actions always included)").
/// `fallback_actions` on the response stays the short action-kind list a
/// caller can render as always-present buttons; these are the same three
/// actions modeled as full options for anything that renders `options`
/// uniformly.
fn fallback_options() -> Vec<RemediationOption> {
    [
        ("retry", "Retry", "Retry the failed step as-is."),
        ("skip", "Skip", "Skip this step and continue with the rest of the plan."),
        ("cancel", "Cancel", "Abandon the plan."),
    ]
    .into_iter()
    .map(|(id, label, description)| RemediationOption {
        id: id.to_string(),
        label: label.to_string(),
        description: description.to_string(),
        strategy: Strategy::Manual,
        recommended: false,
        risk: None,
        availability: Availability::Ready,
        unlock_deps: Vec::new(),
        source_layer: RemediationLayer::Bootstrap,
    })
    .collect()
}

/// `analyse_failure(tool_id, step, stderr, exit_code, method, profile, chain?)`
/// per spec.md §4.8. Returns a response whose `options` is never empty — the
/// retry/skip/cancel fallback is always present even if no handler matched.
#[allow(clippy::too_many_arguments)]
pub fn analyse_failure(
    tool_id: &str,
    step_idx: usize,
    step_label: &str,
    stderr: &str,
    exit_code: Option<i32>,
    method: MethodKey,
    profile: &HostProfile,
    store: &RecipeStore,
    chain: Option<&EscalationChain>,
) -> RemediationResponse {
    let recipe = store.get_recipe(tool_id);
    let matches = collect_matches(recipe, method, store, stderr, exit_code);

    let failure = match matches.first() {
        Some(first) => FailureInfo {
            failure_id: first.handler.failure_id.clone(),
            category: first.handler.category,
            label: first.handler.label.clone(),
            description: first.handler.description.clone(),
            matched_layer: first.layer,
            matched_method: Some(method_key_name(method)),
        },
        None => FailureInfo {
            failure_id: "unknown".to_string(),
            category: FailureCategory::Environment,
            label: "Unclassified failure".to_string(),
            description: "No handler matched this failure's stderr or exit code.".to_string(),
            matched_layer: RemediationLayer::Bootstrap,
            matched_method: Some(method_key_name(method)),
        },
    };

    let mut options = merge_and_order(&matches, recipe, profile, store);
    options.extend(fallback_options());
    let chain_summary = chain.map(|c| c.summary()).unwrap_or_else(ChainSummary::none);

    RemediationResponse {
        ok: false,
        tool_id: tool_id.to_string(),
        step_idx,
        step_label: step_label.to_string(),
        exit_code,
        stderr: stderr.to_string(),
        failure,
        options,
        chain: chain_summary,
        fallback_actions: RemediationResponse::FALLBACK_ACTIONS.to_vec(),
    }
}

fn method_key_name(key: MethodKey) -> String {
    serde_json::to_value(key).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default()
}

/// Creates a fresh escalation chain anchored at the original failed plan.
/// `chain_id` is caller-supplied (the executor/CLI mints a UUID) so this
/// module stays free of a random-number dependency.
pub fn create_chain(chain_id: String, tool_id: &str, plan: Plan, failed_step_idx: usize) -> EscalationChain {
    EscalationChain::new(
        chain_id,
        OriginalGoal { tool_id: tool_id.to_string(), plan, failed_step_idx },
    )
}

#[derive(Debug)]
pub enum EscalateError {
    MaxDepthExceeded,
    CycleDetected { tool_id: String },
}

/// Pushes a new frame for the dependency the user chose to unlock. Enforces
/// the hard stack cap and the cycle check (spec.md §3.5): a `tool_id` already
/// present in the chain cannot be escalated into again.
pub fn escalate(
    chain: &mut EscalationChain,
    failure_id: &str,
    chosen_option_id: &str,
    unlock_tool_id: &str,
    sub_plan: Option<Plan>,
) -> Result<(), EscalateError> {
    if chain.is_at_capacity() {
        return Err(EscalateError::MaxDepthExceeded);
    }
    let already_present = chain.stack.iter().any(|frame| {
        frame.breadcrumbs.iter().any(|crumb| crumb == unlock_tool_id)
    });
    if already_present {
        return Err(EscalateError::CycleDetected { tool_id: unlock_tool_id.to_string() });
    }
    let depth = chain.stack.len() as u32;
    chain.stack.push(ChainFrame {
        depth,
        failure_id: failure_id.to_string(),
        chosen_option_id: chosen_option_id.to_string(),
        plan: sub_plan,
        status: FrameStatus::Pending,
        breadcrumbs: vec![unlock_tool_id.to_string()],
    });
    chain.updated_at = chrono::Utc::now();
    Ok(())
}

/// Marks the top frame `Done` and pops it, returning the next frame still
/// pending (the caller re-resolves its parent option's availability) or
/// `None` once the stack is empty, signalling a retry of the original plan
/// from `failed_step_idx`.
pub fn de_escalate(chain: &mut EscalationChain) -> Option<ChainFrame> {
    if let Some(top) = chain.stack.last_mut() {
        top.status = FrameStatus::Done;
    }
    chain.stack.pop();
    chain.updated_at = chrono::Utc::now();
    chain.stack.last().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use toolctl_types::recipe::Risk;

    fn option(id: &str, strategy: Strategy) -> RemediationOptionRecord {
        RemediationOptionRecord {
            id: id.to_string(),
            label: id.to_string(),
            description: String::new(),
            icon: None,
            recommended: false,
            strategy,
            risk: None,
            dep: None,
            switch_to: None,
            method: None,
            packages: None,
            modifier: None,
            repo_commands: None,
            min_version: None,
            fix_commands: None,
            instructions: None,
            dynamic_packages: None,
            arch_exclude: None,
        }
    }

    fn handler(pattern: &str, options: Vec<RemediationOptionRecord>) -> HandlerRecord {
        HandlerRecord {
            pattern: pattern.to_string(),
            exit_code: None,
            detect_fn: None,
            failure_id: "f".to_string(),
            category: FailureCategory::PackageManager,
            label: "failure".to_string(),
            description: "desc".to_string(),
            options,
        }
    }

    #[test]
    fn unmatched_failure_still_returns_nonempty_options_with_fallback() {
        let store = RecipeStore::default();
        let profile = HostProfile::default();
        let response = analyse_failure(
            "ruff", 0, "install", "some weird error", Some(1), MethodKey::Default, &profile, &store, None,
        );
        assert_eq!(response.options.len(), 3);
        assert!(response.options.iter().all(|o| o.availability == Availability::Ready));
        assert_eq!(response.fallback_actions.len(), 3);
        assert_eq!(response.failure.failure_id, "unknown");
    }

    #[test]
    fn pep668_style_cascade_merges_options_across_layers() {
        let mut recipe = minimal_recipe("ruff");
        recipe.on_failure.push(handler(
            "externally-managed-environment",
            vec![
                {
                    let mut o = option("use-pipx", Strategy::InstallDepThenSwitch);
                    o.dep = Some("pipx".to_string());
                    o.recommended = true;
                    o
                },
                {
                    let mut o = option("break-system", Strategy::RetryWithModifier);
                    o.risk = Some(Risk::High);
                    o
                },
            ],
        ));
        let mut recipes = BTreeMap::new();
        recipes.insert("ruff".to_string(), recipe);
        let store = RecipeStore::from_recipes(recipes);
        let profile = HostProfile::default();

        let response = analyse_failure(
            "ruff",
            0,
            "pip install",
            "error: externally-managed-environment",
            Some(1),
            MethodKey::Pip,
            &profile,
            &store,
            None,
        );

        assert_eq!(response.failure.matched_layer, RemediationLayer::Recipe);
        let pipx = response.options.iter().find(|o| o.id == "use-pipx").unwrap();
        assert_eq!(pipx.availability, Availability::Locked);
        assert!(!pipx.unlock_deps.is_empty());
        // recommended option sorts first
        assert_eq!(response.options[0].id, "use-pipx");
    }

    #[test]
    fn arch_exclude_forces_impossible_regardless_of_strategy() {
        let mut opt = option("cuda", Strategy::RetryWithModifier);
        opt.arch_exclude = Some(vec!["arm64".to_string()]);
        let store = RecipeStore::default();
        let mut profile = HostProfile::default();
        profile.fast.arch = "arm64".to_string();
        let (availability, _) = compute_availability(&opt, None, &profile, &store);
        assert_eq!(availability, Availability::Impossible);
    }

    #[test]
    fn escalate_rejects_reentering_a_tool_already_in_the_stack() {
        let plan = Plan::already_installed("ruff", "ruff");
        let mut chain = create_chain("c1".to_string(), "ruff", plan, 0);
        escalate(&mut chain, "f1", "use-pipx", "pipx", None).expect("first escalation succeeds");
        let err = escalate(&mut chain, "f2", "use-pipx-again", "pipx", None);
        assert!(matches!(err, Err(EscalateError::CycleDetected { .. })));
    }

    #[test]
    fn escalate_rejects_past_max_depth() {
        let plan = Plan::already_installed("ruff", "ruff");
        let mut chain = create_chain("c1".to_string(), "ruff", plan, 0);
        chain.max_depth = 1;
        escalate(&mut chain, "f1", "opt1", "dep1", None).expect("within cap");
        let err = escalate(&mut chain, "f2", "opt2", "dep2", None);
        assert!(matches!(err, Err(EscalateError::MaxDepthExceeded)));
    }

    #[test]
    fn de_escalate_empties_the_stack_and_signals_retry() {
        let plan = Plan::already_installed("ruff", "ruff");
        let mut chain = create_chain("c1".to_string(), "ruff", plan, 0);
        escalate(&mut chain, "f1", "opt1", "dep1", None).expect("push");
        assert!(de_escalate(&mut chain).is_none());
        assert!(chain.stack.is_empty());
    }

    fn minimal_recipe(tool_id: &str) -> Recipe {
        let mut install = BTreeMap::new();
        install.insert(MethodKey::Pip, vec!["pip".to_string(), "install".to_string()]);
        let mut needs_sudo = BTreeMap::new();
        needs_sudo.insert(MethodKey::Pip, false);
        Recipe {
            tool_id: tool_id.to_string(),
            label: tool_id.to_string(),
            cli: None,
            category: None,
            risk: Risk::Low,
            install,
            needs_sudo,
            prefer: Vec::new(),
            requires: Default::default(),
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
        }
    }
}
