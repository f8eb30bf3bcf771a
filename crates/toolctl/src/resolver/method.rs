//! C4 Method Selector: picks one install method key from a recipe's
//! `install` map for the current profile.

use toolctl_types::profile::HostProfile;
use toolctl_types::recipe::{MethodKey, Recipe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedMethod {
    pub key: MethodKey,
    pub command: Vec<String>,
    pub needs_sudo: bool,
}

/// Per spec.md's open question: the source's `_pick_install_method` does not
/// guarantee feasibility beyond existence. This implementation checks
/// feasibility explicitly, the conservative reading the spec recommends.
pub(crate) fn is_feasible(key: MethodKey, profile: &HostProfile) -> bool {
    match key {
        MethodKey::Snap => profile.fast.package_manager.snap_available,
        MethodKey::Apt
        | MethodKey::Dnf
        | MethodKey::Yum
        | MethodKey::Apk
        | MethodKey::Pacman
        | MethodKey::Zypper
        | MethodKey::Brew => profile
            .fast
            .package_manager
            .available
            .iter()
            .any(|pm| pm.binary_name() == method_pm_binary(key)),
        MethodKey::Pip | MethodKey::Npm | MethodKey::Cargo | MethodKey::Go | MethodKey::Default => true,
    }
}

fn method_pm_binary(key: MethodKey) -> &'static str {
    match key {
        MethodKey::Apt => "apt-get",
        MethodKey::Dnf => "dnf",
        MethodKey::Yum => "yum",
        MethodKey::Apk => "apk",
        MethodKey::Pacman => "pacman",
        MethodKey::Zypper => "zypper",
        MethodKey::Brew => "brew",
        _ => "",
    }
}

fn primary_as_method_key(profile: &HostProfile) -> Option<MethodKey> {
    use toolctl_types::profile::PackageManager as Pm;
    Some(match profile.primary_pm()? {
        Pm::Apt => MethodKey::Apt,
        Pm::Dnf => MethodKey::Dnf,
        Pm::Yum => MethodKey::Yum,
        Pm::Apk => MethodKey::Apk,
        Pm::Pacman => MethodKey::Pacman,
        Pm::Zypper => MethodKey::Zypper,
        Pm::Brew => MethodKey::Brew,
    })
}

/// `pick_method(recipe, profile)` per spec.md §4.4: `prefer` entries first
/// (feasibility-checked), then the profile's primary package manager, then
/// `snap`, then `_default`. First match wins.
pub fn pick_method(recipe: &Recipe, profile: &HostProfile) -> Option<SelectedMethod> {
    let candidates = recipe
        .prefer
        .iter()
        .copied()
        .chain(primary_as_method_key(profile))
        .chain(std::iter::once(MethodKey::Snap))
        .chain(std::iter::once(MethodKey::Default));

    for key in candidates {
        if !recipe.install.contains_key(&key) || !is_feasible(key, profile) {
            continue;
        }
        let needs_sudo = *recipe.needs_sudo.get(&key).unwrap_or(&false);
        return Some(SelectedMethod {
            key,
            command: recipe.install[&key].clone(),
            needs_sudo,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use toolctl_types::profile::{PackageManager, PackageManagerInfo};
    use toolctl_types::recipe::Risk;

    fn recipe_with_methods(methods: &[MethodKey]) -> Recipe {
        let mut install = BTreeMap::new();
        let mut needs_sudo = BTreeMap::new();
        for &m in methods {
            install.insert(m, vec!["install".to_string()]);
            needs_sudo.insert(m, m != MethodKey::Cargo);
        }
        Recipe {
            tool_id: "x".to_string(),
            label: "x".to_string(),
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

    #[test]
    fn prefers_primary_package_manager_over_default() {
        let recipe = recipe_with_methods(&[MethodKey::Apt, MethodKey::Default]);
        let mut profile = toolctl_types::profile::HostProfile::default();
        profile.fast.package_manager = PackageManagerInfo {
            primary: Some(PackageManager::Apt),
            available: vec![PackageManager::Apt],
            snap_available: false,
        };
        let picked = pick_method(&recipe, &profile).expect("some method");
        assert_eq!(picked.key, MethodKey::Apt);
    }

    #[test]
    fn falls_back_to_default_when_nothing_else_matches() {
        let recipe = recipe_with_methods(&[MethodKey::Default]);
        let profile = toolctl_types::profile::HostProfile::default();
        let picked = pick_method(&recipe, &profile).expect("default always feasible");
        assert_eq!(picked.key, MethodKey::Default);
    }

    #[test]
    fn prefer_list_wins_even_over_primary_pm() {
        let mut recipe = recipe_with_methods(&[MethodKey::Apt, MethodKey::Cargo, MethodKey::Default]);
        recipe.prefer = vec![MethodKey::Cargo];
        let mut profile = toolctl_types::profile::HostProfile::default();
        profile.fast.package_manager = PackageManagerInfo {
            primary: Some(PackageManager::Apt),
            available: vec![PackageManager::Apt],
            snap_available: false,
        };
        let picked = pick_method(&recipe, &profile).expect("some method");
        assert_eq!(picked.key, MethodKey::Cargo);
    }

    #[test]
    fn returns_none_when_install_map_is_empty() {
        let recipe = recipe_with_methods(&[]);
        let profile = toolctl_types::profile::HostProfile::default();
        assert!(pick_method(&recipe, &profile).is_none());
    }
}
