//! C2 Recipe Store: an immutable, in-memory catalog loaded once at startup.
//!
//! Loading validates referential integrity eagerly (spec.md §4.2) so that
//! every downstream component — resolver, executor, remediation engine — can
//! treat the catalog as infallible once constructed.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use toolctl_types::recipe::{
    HandlerRecord, KnownPackages, LibToPackageMap, MethodKey, PackageGroups, PackageManagerKey,
    Recipe,
};

/// A single catalog file on disk: one recipe plus its per-tool failure
/// handler overrides, matching `TOOL_RECIPES` + `TOOL_FAILURE_HANDLERS` in
/// spec.md §6.4 collapsed into one JSON document per tool.
#[derive(Debug, serde::Deserialize)]
struct RecipeFile {
    recipe: Recipe,
}

#[derive(Debug, Default, serde::Deserialize)]
struct CatalogExtras {
    #[serde(default)]
    method_family_handlers: BTreeMap<MethodKey, Vec<HandlerRecord>>,
    #[serde(default)]
    infra_handlers: Vec<HandlerRecord>,
    #[serde(default)]
    bootstrap_handlers: Vec<HandlerRecord>,
    #[serde(default)]
    package_groups: PackageGroups,
    #[serde(default)]
    known_packages: KnownPackages,
    #[serde(default)]
    lib_to_package_map: LibToPackageMap,
}

#[derive(Debug, Default)]
pub struct RecipeStore {
    recipes: BTreeMap<String, Recipe>,
    method_family_handlers: BTreeMap<MethodKey, Vec<HandlerRecord>>,
    infra_handlers: Vec<HandlerRecord>,
    bootstrap_handlers: Vec<HandlerRecord>,
    package_groups: PackageGroups,
    known_packages: KnownPackages,
    lib_to_package_map: LibToPackageMap,
}

impl RecipeStore {
    /// Loads every `*.recipe.json` file in `dir` plus a single
    /// `catalog.json` holding the shared handler/package tables, validating
    /// referential integrity across the whole set before returning. Catalog
    /// errors are startup-time failures (spec.md §7): callers should treat a
    /// successfully constructed store as infallible data from then on.
    pub fn load(dir: &Path) -> Result<RecipeStore> {
        let extras_path = dir.join("catalog.json");
        let extras: CatalogExtras = if extras_path.exists() {
            let raw = std::fs::read_to_string(&extras_path)
                .with_context(|| format!("reading {}", extras_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", extras_path.display()))?
        } else {
            CatalogExtras::default()
        };

        let mut recipes = BTreeMap::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading recipe directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || path.file_name().and_then(|n| n.to_str()) == Some("catalog.json")
            {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: RecipeFile = serde_json::from_str(&raw)
                .with_context(|| format!("parsing recipe {}", path.display()))?;
            recipes.insert(file.recipe.tool_id.clone(), file.recipe);
        }

        let store = RecipeStore {
            recipes,
            method_family_handlers: extras.method_family_handlers,
            infra_handlers: extras.infra_handlers,
            bootstrap_handlers: extras.bootstrap_handlers,
            package_groups: extras.package_groups,
            known_packages: extras.known_packages,
            lib_to_package_map: extras.lib_to_package_map,
        };
        store.validate()?;
        Ok(store)
    }

    pub fn from_recipes(recipes: BTreeMap<String, Recipe>) -> RecipeStore {
        RecipeStore { recipes, ..RecipeStore::default() }
    }

    fn validate(&self) -> Result<()> {
        for recipe in self.recipes.values() {
            for key in recipe.needs_sudo.keys() {
                if !recipe.install.contains_key(key) {
                    bail!(
                        "recipe {}: needs_sudo has key {:?} not present in install",
                        recipe.tool_id,
                        key
                    );
                }
            }
            for key in recipe.install.keys() {
                if !recipe.needs_sudo.contains_key(key) {
                    bail!(
                        "recipe {}: install has key {:?} missing from needs_sudo",
                        recipe.tool_id,
                        key
                    );
                }
            }
            for key in &recipe.prefer {
                if !recipe.install.contains_key(key) {
                    bail!("recipe {}: prefer references unknown method {:?}", recipe.tool_id, key);
                }
            }
            let option_ids: std::collections::BTreeSet<&str> = recipe
                .choices
                .iter()
                .flat_map(|c| c.options.iter().map(|o| o.id.as_str()))
                .collect();
            for variant_id in recipe.install_variants.keys() {
                if !option_ids.contains(variant_id.as_str()) {
                    bail!(
                        "recipe {}: install_variants key {:?} is not any choice's option id",
                        recipe.tool_id,
                        variant_id
                    );
                }
            }
            for handler in &recipe.on_failure {
                if regex::Regex::new(&handler.pattern).is_err() {
                    bail!(
                        "recipe {}: on_failure pattern {:?} does not compile",
                        recipe.tool_id,
                        handler.pattern
                    );
                }
            }
            self.check_package_refs(&recipe.on_failure, &format!("recipe {}: on_failure", recipe.tool_id))?;
        }
        for handlers in self.method_family_handlers.values() {
            for handler in handlers {
                if regex::Regex::new(&handler.pattern).is_err() {
                    bail!("method_family_handlers: pattern {:?} does not compile", handler.pattern);
                }
            }
            self.check_package_refs(handlers, "method_family_handlers")?;
        }
        for handler in self.infra_handlers.iter().chain(self.bootstrap_handlers.iter()) {
            if regex::Regex::new(&handler.pattern).is_err() {
                bail!("infra/bootstrap handler: pattern {:?} does not compile", handler.pattern);
            }
        }
        self.check_package_refs(&self.infra_handlers, "infra_handlers")?;
        self.check_package_refs(&self.bootstrap_handlers, "bootstrap_handlers")?;
        Ok(())
    }

    /// spec.md §4.2's "package-group references exist" check: every handler
    /// option whose `packages` is a `PackageRef::Named` reference must name
    /// a group actually present in `package_groups`, checked eagerly at
    /// load time so the remediation engine never has to handle a dangling
    /// reference.
    fn check_package_refs(&self, handlers: &[HandlerRecord], context: &str) -> Result<()> {
        for handler in handlers {
            for option in &handler.options {
                if let Some(toolctl_types::recipe::PackageRef::Named(name)) = &option.packages {
                    if !self.package_groups.contains_key(name) {
                        bail!(
                            "{context}: option {:?} references unknown package group {:?}",
                            option.id,
                            name
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get_recipe(&self, tool_id: &str) -> Option<&Recipe> {
        self.recipes.get(tool_id)
    }

    pub fn get_method_family_handlers(&self, method: MethodKey) -> &[HandlerRecord] {
        self.method_family_handlers.get(&method).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn infra_handlers(&self) -> &[HandlerRecord] {
        &self.infra_handlers
    }

    pub fn bootstrap_handlers(&self) -> &[HandlerRecord] {
        &self.bootstrap_handlers
    }

    pub fn get_package_group(&self, name: &str) -> Option<&BTreeMap<toolctl_types::profile::DistroFamily, Vec<String>>> {
        self.package_groups.get(name)
    }

    pub fn get_known_package(&self, dep: &str, pm: PackageManagerKey) -> Option<&str> {
        self.known_packages.get(dep)?.get(&pm).map(String::as_str)
    }

    pub fn get_lib_to_package(&self, lib: &str, family: toolctl_types::profile::DistroFamily) -> Option<&str> {
        self.lib_to_package_map.get(lib)?.get(&family).map(String::as_str)
    }

    pub fn tool_ids(&self) -> impl Iterator<Item = &str> {
        self.recipes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use toolctl_types::recipe::Risk;

    fn minimal_recipe(tool_id: &str) -> Recipe {
        let mut install = BTreeMap::new();
        install.insert(MethodKey::Default, vec!["true".to_string()]);
        let mut needs_sudo = BTreeMap::new();
        needs_sudo.insert(MethodKey::Default, false);
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

    #[test]
    fn validate_passes_on_well_formed_catalog() {
        let mut recipes = BTreeMap::new();
        recipes.insert("ruff".to_string(), minimal_recipe("ruff"));
        let store = RecipeStore::from_recipes(recipes);
        assert!(store.validate().is_ok());
    }

    #[test]
    fn validate_rejects_prefer_referencing_unknown_method() {
        let mut recipe = minimal_recipe("ruff");
        recipe.prefer.push(MethodKey::Snap);
        let mut recipes = BTreeMap::new();
        recipes.insert("ruff".to_string(), recipe);
        let store = RecipeStore::from_recipes(recipes);
        assert!(store.validate().is_err());
    }

    fn handler_with_package_ref(group: &str) -> toolctl_types::recipe::HandlerRecord {
        use toolctl_types::recipe::{FailureCategory, PackageRef, RemediationOptionRecord, Strategy};
        toolctl_types::recipe::HandlerRecord {
            pattern: "some failure".to_string(),
            exit_code: None,
            detect_fn: None,
            failure_id: "missing-build-deps".to_string(),
            category: FailureCategory::Dependency,
            label: "Missing build dependencies".to_string(),
            description: "Build tools are missing.".to_string(),
            options: vec![RemediationOptionRecord {
                id: "install-build-tools".to_string(),
                label: "Install build tools".to_string(),
                description: "Installs the platform's build toolchain.".to_string(),
                icon: None,
                recommended: true,
                strategy: Strategy::InstallPackages,
                risk: None,
                dep: None,
                switch_to: None,
                method: None,
                packages: Some(PackageRef::Named(group.to_string())),
                modifier: None,
                repo_commands: None,
                min_version: None,
                fix_commands: None,
                instructions: None,
                dynamic_packages: None,
                arch_exclude: None,
            }],
        }
    }

    #[test]
    fn validate_rejects_recipe_handler_referencing_unknown_package_group() {
        let mut recipe = minimal_recipe("ruff");
        recipe.on_failure.push(handler_with_package_ref("build_tools"));
        let mut recipes = BTreeMap::new();
        recipes.insert("ruff".to_string(), recipe);
        let store = RecipeStore::from_recipes(recipes);
        assert!(store.validate().is_err());
    }

    #[test]
    fn validate_accepts_handler_referencing_a_declared_package_group() {
        let mut recipe = minimal_recipe("ruff");
        recipe.on_failure.push(handler_with_package_ref("build_tools"));
        let mut recipes = BTreeMap::new();
        recipes.insert("ruff".to_string(), recipe);
        let mut package_groups = toolctl_types::recipe::PackageGroups::new();
        package_groups.insert("build_tools".to_string(), BTreeMap::new());
        let store = RecipeStore { recipes, package_groups, ..RecipeStore::default() };
        assert!(store.validate().is_ok());
    }

    #[test]
    fn get_recipe_returns_none_for_unknown_tool() {
        let store = RecipeStore::default();
        assert!(store.get_recipe("does-not-exist").is_none());
    }
}
