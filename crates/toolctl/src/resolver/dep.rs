//! C3 Dep Resolver: classifies a dependency name against the recipe store
//! and profile. Does not itself recurse into sub-plans — that is the Plan
//! Builder's `collect_deps` job; this module only answers "what is this
//! name".

use toolctl_types::profile::HostProfile;
use toolctl_types::recipe::PackageManagerKey;

use crate::recipes::RecipeStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepClassification {
    /// A `tool_id` with a full recipe: recurse via the Plan Builder.
    Recipe { tool_id: String },
    /// A system-package name known to the primary package manager.
    SystemPackage { package: String },
    /// A library name (e.g. `ssl`) mapped through `LIB_TO_PACKAGE_MAP`.
    Library { package: String },
    /// Last resort: the dependency name is used verbatim as the package name.
    Identity { name: String },
}

fn package_manager_key(profile: &HostProfile) -> Option<PackageManagerKey> {
    use toolctl_types::profile::PackageManager as Pm;
    Some(match profile.primary_pm()? {
        Pm::Apt => PackageManagerKey::Apt,
        Pm::Dnf => PackageManagerKey::Dnf,
        Pm::Yum => PackageManagerKey::Yum,
        Pm::Apk => PackageManagerKey::Apk,
        Pm::Pacman => PackageManagerKey::Pacman,
        Pm::Zypper => PackageManagerKey::Zypper,
        Pm::Brew => PackageManagerKey::Brew,
    })
}

/// Classify `dep` per spec.md §4.3, in priority order: recipe, known system
/// package, library mapping, identity.
pub fn classify(dep: &str, store: &RecipeStore, profile: &HostProfile) -> DepClassification {
    if store.get_recipe(dep).is_some() {
        return DepClassification::Recipe { tool_id: dep.to_string() };
    }
    if let Some(pm) = package_manager_key(profile) {
        if let Some(package) = store.get_known_package(dep, pm) {
            return DepClassification::SystemPackage { package: package.to_string() };
        }
        if let Some(package) = store.get_lib_to_package(dep, profile.distro_family()) {
            return DepClassification::Library { package: package.to_string() };
        }
    }
    DepClassification::Identity { name: dep.to_string() }
}

/// Tracks dependencies already queued within a single resolve so a revisit
/// is a no-op and a dep that would re-enter its own install is flagged as a
/// cycle (spec.md §4.3 "cycle handling").
#[derive(Debug, Default)]
pub struct VisitGuard {
    visited: std::collections::BTreeSet<String>,
    stack: Vec<String>,
}

impl VisitGuard {
    pub fn new() -> VisitGuard {
        VisitGuard::default()
    }

    /// Returns `Err(cycle)` if `tool_id` is already on the current recursion
    /// stack (a genuine cycle), `Ok(false)` if it was already visited off the
    /// current stack (no-op revisit), `Ok(true)` if this is the first visit.
    pub fn enter(&mut self, tool_id: &str) -> Result<bool, Vec<String>> {
        if self.stack.iter().any(|t| t == tool_id) {
            let mut cycle = self.stack.clone();
            cycle.push(tool_id.to_string());
            return Err(cycle);
        }
        if self.visited.contains(tool_id) {
            return Ok(false);
        }
        self.visited.insert(tool_id.to_string());
        self.stack.push(tool_id.to_string());
        Ok(true)
    }

    pub fn exit(&mut self, tool_id: &str) {
        if self.stack.last().map(String::as_str) == Some(tool_id) {
            self.stack.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revisit_after_exit_is_a_noop_not_a_cycle() {
        let mut guard = VisitGuard::new();
        assert_eq!(guard.enter("curl"), Ok(true));
        guard.exit("curl");
        assert_eq!(guard.enter("curl"), Ok(false));
    }

    #[test]
    fn reentry_while_on_stack_is_a_cycle() {
        let mut guard = VisitGuard::new();
        assert_eq!(guard.enter("a"), Ok(true));
        assert_eq!(guard.enter("b"), Ok(true));
        assert_eq!(guard.enter("a"), Err(vec!["a".to_string(), "b".to_string(), "a".to_string()]));
    }

    #[test]
    fn identity_is_the_last_resort_classification() {
        let store = RecipeStore::default();
        let profile = HostProfile::default();
        assert_eq!(
            classify("some-unknown-thing", &store, &profile),
            DepClassification::Identity { name: "some-unknown-thing".to_string() }
        );
    }
}
