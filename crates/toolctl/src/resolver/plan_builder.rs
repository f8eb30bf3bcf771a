//! C6 Plan Builder: orchestrates the Dep Resolver, Method Selector, and
//! Choice Resolver into an ordered step list, batching package-manager
//! steps and attaching risk, rollback, and `restart_required` metadata.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use toolctl_types::enriched::EnrichedChoice;
use toolctl_types::plan::{
    Answers, ChoiceAnswer, ConfirmationGate, Plan, PlanError, RestartRequired, RiskSummary,
    RollbackPlan, RollbackStep, Step, StepType,
};
use toolctl_types::profile::HostProfile;
use toolctl_types::recipe::{Condition, InstallVariant, MethodKey, Recipe, Risk, StepRecord};

use crate::recipes::RecipeStore;
use crate::resolver::dep::{self, DepClassification, VisitGuard};
use crate::resolver::method;

pub fn resolve_choices(tool_id: &str, profile: &HostProfile, store: &RecipeStore) -> Vec<EnrichedChoice> {
    match store.get_recipe(tool_id) {
        Some(recipe) => crate::resolver::choice::resolve_choices(recipe, profile),
        None => Vec::new(),
    }
}

pub fn resolve_install_plan(tool_id: &str, profile: &HostProfile, store: &RecipeStore) -> Plan {
    if let Some(recipe) = store.get_recipe(tool_id) {
        if !recipe.choices.is_empty() {
            return Plan::errored(tool_id, PlanError::ConstraintUnsatisfiable {
                missing: vec!["recipe declares choices; call resolve_install_plan_with_choices".to_string()],
            });
        }
    }
    resolve_install_plan_with_choices(tool_id, profile, store, &Answers::default())
}

/// Two-pass entry point (spec.md §4.6). Whether the *caller* later executes
/// this plan for real or dry-run is an `execute()`-time decision (§C7);
/// the resolved step list is identical either way.
pub fn resolve_install_plan_with_choices(
    tool_id: &str,
    profile: &HostProfile,
    store: &RecipeStore,
    answers: &Answers,
) -> Plan {
    let Some(recipe) = store.get_recipe(tool_id) else {
        return Plan::errored(tool_id, PlanError::NoRecipe);
    };

    let cli = recipe.cli.clone().unwrap_or_else(|| recipe.tool_id.clone());
    if which::which(&cli).is_ok() {
        return Plan::already_installed(tool_id, &recipe.label);
    }

    if !recipe.choices.is_empty() {
        if let Some(unsatisfiable) = constraint_unsatisfiable(recipe, profile) {
            return Plan::errored(tool_id, unsatisfiable);
        }
    }

    let mut visited = VisitGuard::new();
    let mut packages: Vec<String> = Vec::new();
    let mut tool_steps: Vec<Step> = Vec::new();
    let mut pending_post_env: Option<String> = None;

    if let Err(cycle) = collect_deps(
        tool_id,
        store,
        profile,
        answers,
        &mut visited,
        &mut packages,
        &mut tool_steps,
        &mut pending_post_env,
    ) {
        return Plan::errored(tool_id, PlanError::Cycle { tool_ids: cycle });
    }

    let method = match method::pick_method(recipe, profile) {
        Some(m) => m,
        None => return Plan::errored(tool_id, PlanError::NoMethodAvailable),
    };

    let mut steps: Vec<Step> = Vec::new();

    if let Some(repo_steps) = recipe.repo_setup.get(&method.key) {
        for record in repo_steps {
            steps.push(step_from_record(record, StepType::RepoSetup, Some(method.key)));
        }
    }

    if !packages.is_empty() {
        let missing = filter_missing_packages(&packages, profile);
        if !missing.is_empty() {
            steps.push(packages_step(&missing, profile, &method.key));
        }
    }

    steps.append(&mut tool_steps);

    apply_variant(&mut steps, recipe, answers);

    for record in &recipe.post_install {
        if condition_holds(&record.condition, profile) {
            steps.push(step_from_record(record, StepType::PostInstall, None));
        }
    }

    if let Some(verify_command) = &recipe.verify {
        steps.push(Step {
            id: format!("verify:{tool_id}"),
            step_type: StepType::Verify,
            label: format!("verify {}", recipe.label),
            command: verify_command.clone(),
            needs_sudo: false,
            risk: Risk::Low,
            condition: None,
            rollback: None,
            restart_required: None,
            depends_on: Vec::new(),
            backup_before: Vec::new(),
            timeout_seconds: None,
            post_env: pending_post_env.clone(),
            sensitive: false,
            method: None,
        });
    }

    for step in &mut steps {
        if step.risk == Risk::Low {
            step.risk = infer_risk(step, recipe.risk);
        }
    }

    let risk_summary = RiskSummary::from_steps(&steps);
    let confirmation_gate = ConfirmationGate::for_risk(risk_summary.level);
    let needs_sudo = steps.iter().any(|s| s.needs_sudo);
    let warning = (needs_sudo && !profile.fast.capabilities.has_sudo)
        .then(|| "this plan requires sudo but the host reports no sudo available".to_string());

    let rollback_plan = Some(build_rollback_plan(&steps));

    Plan {
        tool: tool_id.to_string(),
        label: recipe.label.clone(),
        already_installed: false,
        error: None,
        available_methods: recipe.install.keys().map(method_key_name).collect(),
        suggestion: None,
        needs_sudo,
        steps,
        risk_summary,
        risk_escalation: None,
        confirmation_gate,
        warning,
        rollback_plan,
    }
}

fn method_key_name(key: &MethodKey) -> String {
    serde_json::to_value(key)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn constraint_unsatisfiable(recipe: &Recipe, profile: &HostProfile) -> Option<PlanError> {
    let choices = crate::resolver::choice::resolve_choices(recipe, profile);
    let mut missing = Vec::new();
    for choice in &choices {
        if choice.options.iter().all(|o| !o.available) {
            for option in &choice.options {
                missing.extend(option.all_failures.iter().cloned());
            }
        }
    }
    (!choices.is_empty() && choices.iter().all(|c| c.options.iter().all(|o| !o.available)))
        .then_some(PlanError::ConstraintUnsatisfiable { missing })
}

#[allow(clippy::too_many_arguments)]
fn collect_deps(
    tool_id: &str,
    store: &RecipeStore,
    profile: &HostProfile,
    answers: &Answers,
    visited: &mut VisitGuard,
    packages: &mut Vec<String>,
    tool_steps: &mut Vec<Step>,
    pending_post_env: &mut Option<String>,
) -> Result<(), Vec<String>> {
    match visited.enter(tool_id) {
        Err(cycle) => return Err(cycle),
        Ok(false) => return Ok(()),
        Ok(true) => {}
    }

    let Some(recipe) = store.get_recipe(tool_id) else {
        visited.exit(tool_id);
        return Ok(());
    };

    let cli = recipe.cli.clone().unwrap_or_else(|| recipe.tool_id.clone());
    let already_on_path = which::which(&cli).is_ok();

    for dep_name in &recipe.requires.binaries {
        match dep::classify(dep_name, store, profile) {
            DepClassification::Recipe { tool_id: dep_tool } => {
                collect_deps(&dep_tool, store, profile, answers, visited, packages, tool_steps, pending_post_env)?;
            }
            DepClassification::SystemPackage { package } | DepClassification::Library { package } => {
                if !packages.contains(&package) {
                    packages.push(package);
                }
            }
            DepClassification::Identity { name } => {
                if !packages.contains(&name) {
                    packages.push(name);
                }
            }
        }
    }

    if let Some(family_packages) = recipe.requires.packages.get(&profile.distro_family()) {
        for pkg in family_packages {
            if !packages.contains(pkg) {
                packages.push(pkg.clone());
            }
        }
    }

    if !already_on_path {
        if let Some(selected) = method::pick_method(recipe, profile) {
            let command = substitute_vars(&selected.command, profile, recipe, answers);
            tool_steps.push(Step {
                id: format!("tool:{tool_id}"),
                step_type: StepType::Tool,
                label: recipe.label.clone(),
                command,
                needs_sudo: selected.needs_sudo,
                risk: Risk::Low,
                condition: None,
                rollback: None,
                restart_required: recipe.restart_required,
                depends_on: Vec::new(),
                backup_before: Vec::new(),
                timeout_seconds: None,
                post_env: pending_post_env.take(),
                sensitive: false,
                method: Some(selected.key),
            });
            *pending_post_env = recipe.post_env.clone();
        }
    }

    visited.exit(tool_id);
    Ok(())
}

fn substitute_vars(command: &[String], profile: &HostProfile, recipe: &Recipe, answers: &Answers) -> Vec<String> {
    command
        .iter()
        .map(|token| {
            let mut rendered = token.replace("{arch}", profile.arch());
            if let Some(mapped) = recipe.arch_map.get(profile.arch()) {
                rendered = rendered.replace("{arch}", mapped);
            }
            for (input_id, value) in &answers.inputs {
                rendered = rendered.replace(&format!("{{{input_id}}}"), value);
            }
            rendered
        })
        .collect()
}

fn step_from_record(record: &StepRecord, step_type: StepType, method: Option<MethodKey>) -> Step {
    Step {
        id: format!("{step_type:?}:{}", record.label).to_lowercase(),
        step_type,
        label: record.label.clone(),
        command: record.command.clone(),
        needs_sudo: record.needs_sudo,
        risk: Risk::Low,
        condition: record.condition.clone(),
        rollback: None,
        restart_required: None,
        depends_on: Vec::new(),
        backup_before: Vec::new(),
        timeout_seconds: None,
        post_env: None,
        sensitive: false,
        method,
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

fn packages_step(missing: &[String], profile: &HostProfile, method: &MethodKey) -> Step {
    let needs_sudo = !profile.fast.capabilities.is_root && *method != MethodKey::Brew;
    Step {
        id: "packages".to_string(),
        step_type: StepType::Packages,
        label: "install system packages".to_string(),
        command: pm_command(method, missing),
        needs_sudo,
        risk: Risk::Medium,
        condition: None,
        rollback: None,
        restart_required: None,
        depends_on: Vec::new(),
        backup_before: Vec::new(),
        timeout_seconds: None,
        post_env: None,
        sensitive: false,
        method: Some(*method),
    }
}

fn pm_command(method: &MethodKey, packages: &[String]) -> Vec<String> {
    let mut command = match method {
        MethodKey::Apt => vec!["apt-get".to_string(), "install".to_string(), "-y".to_string()],
        MethodKey::Dnf => vec!["dnf".to_string(), "install".to_string(), "-y".to_string()],
        MethodKey::Yum => vec!["yum".to_string(), "install".to_string(), "-y".to_string()],
        MethodKey::Apk => vec!["apk".to_string(), "add".to_string()],
        MethodKey::Pacman => vec!["pacman".to_string(), "-S".to_string(), "--noconfirm".to_string()],
        MethodKey::Zypper => vec!["zypper".to_string(), "install".to_string(), "-y".to_string()],
        MethodKey::Brew => vec!["brew".to_string(), "install".to_string()],
        _ => vec!["apt-get".to_string(), "install".to_string(), "-y".to_string()],
    };
    command.extend(packages.iter().cloned());
    command
}

fn package_checker(method: &MethodKey) -> Option<(&'static str, Vec<&'static str>)> {
    Some(match method {
        MethodKey::Apt => ("dpkg-query", vec!["-W"]),
        MethodKey::Dnf | MethodKey::Yum => ("rpm", vec!["-q"]),
        MethodKey::Apk => ("apk", vec!["info", "-e"]),
        MethodKey::Pacman => ("pacman", vec!["-Q"]),
        MethodKey::Brew => ("brew", vec!["ls", "--versions"]),
        _ => return None,
    })
}

fn filter_missing_packages(packages: &[String], profile: &HostProfile) -> Vec<String> {
    let Some(primary) = profile.primary_pm() else { return packages.to_vec() };
    let method = match primary {
        toolctl_types::profile::PackageManager::Apt => MethodKey::Apt,
        toolctl_types::profile::PackageManager::Dnf => MethodKey::Dnf,
        toolctl_types::profile::PackageManager::Yum => MethodKey::Yum,
        toolctl_types::profile::PackageManager::Apk => MethodKey::Apk,
        toolctl_types::profile::PackageManager::Pacman => MethodKey::Pacman,
        toolctl_types::profile::PackageManager::Zypper => MethodKey::Zypper,
        toolctl_types::profile::PackageManager::Brew => MethodKey::Brew,
    };
    let Some((checker, args)) = package_checker(&method) else { return packages.to_vec() };
    packages
        .iter()
        .filter(|pkg| {
            let mut full_args: Vec<&str> = args.clone();
            full_args.push(pkg.as_str());
            !std::process::Command::new(checker)
                .args(&full_args)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

fn apply_variant(steps: &mut [Step], recipe: &Recipe, answers: &Answers) {
    for choice in &recipe.choices {
        let Some(answer) = answers.choices.get(&choice.id) else { continue };
        let ChoiceAnswer::Single(option_id) = answer else { continue };
        let Some(option) = choice.options.iter().find(|o| &o.id == option_id) else { continue };
        let Some(variant_id) = &option.variant_id else { continue };
        let Some(variant) = recipe.install_variants.get(variant_id) else { continue };
        let Some(tool_step) = steps.iter_mut().rev().find(|s| s.step_type == StepType::Tool) else { continue };
        if let InstallVariant::Command(command) = variant {
            tool_step.command = command.clone();
        }
    }
}

fn infer_risk(step: &Step, recipe_risk: Risk) -> Risk {
    let mut risk = if step.restart_required == Some(RestartRequired::System) {
        Risk::High
    } else if step.label.to_lowercase().contains("kernel") || step.label.to_lowercase().contains("driver") {
        Risk::High
    } else if step.needs_sudo {
        Risk::Medium
    } else {
        Risk::Low
    };
    if recipe_risk > risk {
        risk = recipe_risk;
    }
    risk
}

fn build_rollback_plan(steps: &[Step]) -> RollbackPlan {
    let rollback_steps = steps
        .iter()
        .rev()
        .map(|step| {
            if let Some(explicit) = &step.rollback {
                return RollbackStep { step_id: step.id.clone(), command: Some(explicit.clone()), manual_only: false };
            }
            if step.restart_required == Some(RestartRequired::System)
                || step.label.to_lowercase().contains("kernel")
                || step.label.to_lowercase().contains("driver")
            {
                return RollbackStep { step_id: step.id.clone(), command: None, manual_only: true };
            }
            derive_undo(step)
        })
        .collect();
    RollbackPlan { steps: rollback_steps }
}

fn derive_undo(step: &Step) -> RollbackStep {
    let program = step.command.first().map(String::as_str).unwrap_or("");
    let undo = match program {
        "pip" | "pip3" => Some(vec!["pip".to_string(), "uninstall".to_string(), "-y".to_string()]),
        "apt-get" => Some(vec!["apt-get".to_string(), "purge".to_string(), "-y".to_string()]),
        "snap" => Some(vec!["snap".to_string(), "remove".to_string()]),
        "cargo" => Some(vec!["cargo".to_string(), "uninstall".to_string()]),
        "brew" => Some(vec!["brew".to_string(), "uninstall".to_string()]),
        _ => None,
    };
    match undo {
        Some(mut prefix) => {
            prefix.extend(step.command.iter().skip(2).cloned());
            RollbackStep { step_id: step.id.clone(), command: Some(prefix), manual_only: false }
        }
        None => RollbackStep { step_id: step.id.clone(), command: None, manual_only: true },
    }
}

/// Kahn's-algorithm validation for DAG-form plans (spec.md §4.6 "DAG form").
/// Linear plans built by `resolve_install_plan*` never declare `depends_on`,
/// so this is exercised by callers assembling an explicit DAG.
pub fn validate_dag(steps: &[Step]) -> Result<Vec<String>, PlanError> {
    let mut indegree: BTreeMap<&str, usize> = steps.iter().map(|s| (s.id.as_str(), 0)).collect();
    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in steps {
        for dep in &step.depends_on {
            *indegree.entry(step.id.as_str()).or_insert(0) += 1;
            edges.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut ready: std::collections::BTreeSet<&str> =
        indegree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
    let mut order = Vec::new();
    while let Some(&id) = ready.iter().next() {
        ready.remove(id);
        order.push(id.to_string());
        for &next in edges.get(id).unwrap_or(&Vec::new()) {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(next);
                }
            }
        }
    }

    if order.len() != steps.len() {
        let remaining: Vec<String> =
            steps.iter().map(|s| s.id.clone()).filter(|id| !order.contains(id)).collect();
        return Err(PlanError::Cycle { tool_ids: remaining });
    }
    Ok(order)
}

/// Compares a persisted plan against one freshly resolved against the
/// *current* profile (spec.md SPEC_FULL "Plan diffing for resume"). `None`
/// means the step identity (id + command, in order) still matches; `Some`
/// carries a human-readable summary of what changed, for the executor to
/// surface as a [`toolctl_types::event::Event::PlanDrift`] warning rather
/// than resuming a stale plan silently.
pub fn diff_for_resume(persisted: &Plan, fresh: &Plan) -> Option<String> {
    if persisted.steps.len() != fresh.steps.len() {
        return Some(format!(
            "step count changed: persisted plan had {}, current profile resolves to {}",
            persisted.steps.len(),
            fresh.steps.len()
        ));
    }
    for (old, new) in persisted.steps.iter().zip(fresh.steps.iter()) {
        if old.id != new.id {
            return Some(format!("step identity changed at this position: {:?} -> {:?}", old.id, new.id));
        }
        if old.command != new.command {
            return Some(format!("command for step {:?} changed: {:?} -> {:?}", old.id, old.command, new.command));
        }
    }
    None
}

/// Deterministic id for a resolved plan, used by the chain store and
/// executor to name persisted state without depending on wall-clock time.
pub fn compute_plan_id(plan: &Plan) -> String {
    let mut hasher = Sha256::new();
    if let Ok(bytes) = serde_json::to_vec(plan) {
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize())
}
