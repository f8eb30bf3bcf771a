//! C5 Choice Resolver: evaluates a recipe's `choices` against the profile,
//! enriching every option with computed availability. Options are never
//! dropped — an unavailable option stays in the output, carrying the reason.

use toolctl_types::enriched::{EnrichedChoice, EnrichedOption};
use toolctl_types::profile::HostProfile;
use toolctl_types::recipe::{ChoiceRecord, OptionRecord, Recipe, Requirements};

/// One failed constraint, in evaluation-priority order. `evaluate` stops
/// filling `failed_constraint`/`disabled_reason` at the first failure but
/// keeps evaluating every later category so `all_failures` is complete.
struct ConstraintCheck {
    constraint: String,
    failure: Option<String>,
}

fn check_hardware(requires: &Requirements, profile: &HostProfile) -> ConstraintCheck {
    let Some(expr) = requires.hardware.as_deref() else {
        return ConstraintCheck { constraint: "hardware".to_string(), failure: None };
    };
    let constraint = format!("hardware.{expr}");
    let gpu = profile.deep.gpu.as_ref();
    let failure = if expr.contains("gpu.nvidia.present") {
        let present = gpu.is_some_and(|g| g.nvidia.is_some());
        (!present).then(|| "No NVIDIA GPU detected".to_string())
    } else if let Some(min) = expr.strip_prefix("disk_free>=") {
        let need: u64 = min.parse().unwrap_or(0);
        let have = profile.deep.filesystem.as_ref().and_then(|f| f.disk_free_bytes).unwrap_or(0);
        (have < need).then(|| format!("requires {need} bytes free disk, have {have}"))
    } else if let Some(min) = expr.strip_prefix("ram>=") {
        let need: u64 = min.parse().unwrap_or(0);
        let have = profile.deep.filesystem.as_ref().and_then(|f| f.ram_total_bytes).unwrap_or(0);
        (have < need).then(|| format!("requires {need} bytes RAM, have {have}"))
    } else {
        None
    };
    ConstraintCheck { constraint, failure }
}

fn check_binaries(requires: &Requirements) -> ConstraintCheck {
    let missing: Vec<&str> = requires
        .binaries
        .iter()
        .map(String::as_str)
        .filter(|bin| which::which(bin).is_err())
        .collect();
    ConstraintCheck {
        constraint: "software.binaries".to_string(),
        failure: (!missing.is_empty()).then(|| format!("missing binaries: {}", missing.join(", "))),
    }
}

fn check_version(requires: &Requirements, profile: &HostProfile) -> ConstraintCheck {
    let Some(expr) = requires.hardware.as_deref().and_then(|e| e.strip_prefix("gpu.nvidia.driver_version>=")) else {
        return ConstraintCheck { constraint: "version".to_string(), failure: None };
    };
    let constraint = format!("version.gpu.nvidia.driver_version>={expr}");
    let failure = profile.deep.gpu.as_ref().and_then(|g| g.nvidia.as_ref()).and_then(|n| n.driver_version.as_deref())
        .and_then(|have| (compare_versions(have, expr) < 0).then(|| format!("driver_version {have} < required {expr}")));
    ConstraintCheck { constraint, failure }
}

/// No recipe in this catalog declares a sudo/root/container-privilege
/// constraint on a choice option today; the slot exists so the fixed
/// evaluation order (§4.5) stays stable if one ever does.
fn check_permission(_profile: &HostProfile) -> ConstraintCheck {
    ConstraintCheck { constraint: "permission".to_string(), failure: None }
}

fn check_network(requires: &Requirements, profile: &HostProfile) -> ConstraintCheck {
    let Some(endpoint) = requires.network.as_deref() else {
        return ConstraintCheck { constraint: "network".to_string(), failure: None };
    };
    let constraint = format!("network.{endpoint}");
    let reachable = profile
        .deep
        .network
        .as_ref()
        .map(|net| net.endpoints.iter().any(|e| e.endpoint == endpoint && e.reachable))
        .unwrap_or(false);
    let failure = (!reachable).then(|| format!("endpoint {endpoint} is unreachable"));
    ConstraintCheck { constraint, failure }
}

/// `requires.kernel_config` doubles as the auth slot via an `env:VAR`
/// token, since the schema has no dedicated auth field.
fn check_auth(requires: &Requirements) -> ConstraintCheck {
    let Some(var) = requires.kernel_config.as_deref().and_then(|t| t.strip_prefix("env:")) else {
        return ConstraintCheck { constraint: "auth".to_string(), failure: None };
    };
    let constraint = format!("auth.env.{var}");
    let failure = std::env::var(var).is_err().then(|| format!("missing required environment variable {var}"));
    ConstraintCheck { constraint, failure }
}

fn compare_versions(have: &str, want: &str) -> i32 {
    let parse = |s: &str| -> Vec<u32> { s.split('.').filter_map(|p| p.parse().ok()).collect() };
    let (h, w) = (parse(have), parse(want));
    for i in 0..h.len().max(w.len()) {
        let a = h.get(i).copied().unwrap_or(0);
        let b = w.get(i).copied().unwrap_or(0);
        if a != b {
            return if a > b { 1 } else { -1 };
        }
    }
    0
}

fn evaluate_option(option: &OptionRecord, profile: &HostProfile) -> EnrichedOption {
    let requires = option.requires.clone().unwrap_or_default();
    let checks = [
        check_hardware(&requires, profile),
        check_binaries(&requires),
        check_version(&requires, profile),
        check_permission(profile),
        check_network(&requires, profile),
        check_auth(&requires),
    ];

    let all_failures: Vec<String> = checks.iter().filter_map(|c| c.failure.clone()).collect();
    let first_failure = checks.iter().find(|c| c.failure.is_some());
    let available = first_failure.is_none();

    EnrichedOption {
        id: option.id.clone(),
        label: option.label.clone(),
        description: option.description.clone(),
        available,
        disabled_reason: first_failure.and_then(|c| c.failure.clone()),
        // `enable_hint` tells the user how to make an unavailable option
        // available; it's meaningless once the option already is.
        enable_hint: (!available).then(|| option.learn_more.clone()).flatten(),
        learn_more: option.learn_more.clone(),
        failed_constraint: first_failure.map(|c| c.constraint.clone()),
        all_failures,
        auto_selected: false,
        risk: option.risk,
        warning: option.warning.clone(),
    }
}

fn is_included(choice: &ChoiceRecord, answers_so_far: &std::collections::BTreeMap<String, String>) -> bool {
    match &choice.depends_on {
        None => true,
        Some(dep) => dep.iter().all(|(choice_id, expected)| {
            answers_so_far.get(choice_id).map(String::as_str) == Some(expected.as_str())
        }),
    }
}

/// `resolve_choices(tool_id, profile)` per spec.md §4.5. `answers_so_far`
/// lets two-pass callers resolve a later `depends_on` choice after an
/// earlier one is answered; pass an empty map for the first pass.
pub fn resolve_choices_with_answers(
    recipe: &Recipe,
    profile: &HostProfile,
    answers_so_far: &std::collections::BTreeMap<String, String>,
) -> Vec<EnrichedChoice> {
    recipe
        .choices
        .iter()
        .filter(|choice| is_included(choice, answers_so_far))
        .map(|choice| {
            let mut options: Vec<EnrichedOption> =
                choice.options.iter().map(|o| evaluate_option(o, profile)).collect();
            let available_count = options.iter().filter(|o| o.available).count();
            if available_count == 1 {
                if let Some(only) = options.iter_mut().find(|o| o.available) {
                    only.auto_selected = true;
                }
            }
            EnrichedChoice::from_record(choice, options)
        })
        .collect()
}

pub fn resolve_choices(recipe: &Recipe, profile: &HostProfile) -> Vec<EnrichedChoice> {
    resolve_choices_with_answers(recipe, profile, &std::collections::BTreeMap::new())
}
