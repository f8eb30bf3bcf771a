use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::profile::DistroFamily;

/// A recipe's install channel. `_default` is the universal fallback (binary
/// download, curl-pipe-bash, pip install, etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKey {
    Apt,
    Dnf,
    Yum,
    Apk,
    Pacman,
    Zypper,
    Brew,
    Snap,
    Pip,
    Npm,
    Cargo,
    Go,
    #[serde(rename = "_default")]
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

/// A small condition AST replacing the source's ad-hoc condition strings
/// (`has_systemd`, `file_exists:/x`). Parsed once at recipe-load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    HasSystemd,
    HasOpenrc,
    NotRoot,
    IsRoot,
    NotContainer,
    HasDocker,
    FileExists { path: String },
}

impl Condition {
    /// Parse the source's `name` / `name:arg` string vocabulary.
    pub fn parse(raw: &str) -> Result<Condition, String> {
        if let Some(path) = raw.strip_prefix("file_exists:") {
            return Ok(Condition::FileExists {
                path: path.to_string(),
            });
        }
        match raw {
            "has_systemd" => Ok(Condition::HasSystemd),
            "has_openrc" => Ok(Condition::HasOpenrc),
            "not_root" => Ok(Condition::NotRoot),
            "is_root" => Ok(Condition::IsRoot),
            "not_container" => Ok(Condition::NotContainer),
            "has_docker" => Ok(Condition::HasDocker),
            other => Err(format!("unknown condition: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub label: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub needs_sudo: bool,
    #[serde(default)]
    pub condition: Option<Condition>,
}

pub type RestartRequired = crate::plan::RestartRequired;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub binaries: Vec<String>,
    #[serde(default)]
    pub packages: BTreeMap<DistroFamily, Vec<String>>,
    #[serde(default)]
    pub kernel_config: Option<String>,
    #[serde(default)]
    pub hardware: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

/// A single option within a choice. Options are never filtered out by the
/// Choice Resolver; availability is computed and attached at resolve time
/// (`EnrichedOption`, in `toolctl`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionRecord {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub requires: Option<Requirements>,
    #[serde(default)]
    pub install_command: Option<Vec<String>>,
    #[serde(default)]
    pub variant_id: Option<String>,
    #[serde(default)]
    pub risk: Option<Risk>,
    #[serde(default)]
    pub warning: Option<String>,
    #[serde(default)]
    pub estimated_time: Option<String>,
    #[serde(default)]
    pub learn_more: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceType {
    Single,
    Multi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceRecord {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub choice_type: ChoiceType,
    #[serde(default)]
    pub depends_on: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub min_select: Option<usize>,
    #[serde(default)]
    pub max_select: Option<usize>,
    pub options: Vec<OptionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Text,
    Number,
    Path,
    Select,
    Boolean,
    Password,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub validation: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFormat {
    Json,
    Ini,
    Yaml,
    Raw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigTemplate {
    pub id: String,
    pub file: String,
    pub format: TemplateFormat,
    pub template: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub needs_sudo: bool,
    #[serde(default)]
    pub post_command: Option<Vec<String>>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub backup: bool,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub path_append: Vec<String>,
    #[serde(default)]
    pub profile_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Environment,
    Dependency,
    Permissions,
    Network,
    Disk,
    Resources,
    Timeout,
    Compiler,
    PackageManager,
    Bootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    InstallDep,
    InstallDepThenSwitch,
    InstallPackages,
    SwitchMethod,
    RetryWithModifier,
    AddRepo,
    UpgradeDep,
    EnvFix,
    Manual,
    CleanupRetry,
}

/// A single remediation action. Untagged at rest: availability (ready/locked/
/// impossible) is computed at runtime against a `HostProfile`, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationOptionRecord {
    pub id: String,
    pub label: String,
    pub description: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub recommended: bool,
    pub strategy: Strategy,
    #[serde(default)]
    pub risk: Option<Risk>,
    #[serde(default)]
    pub dep: Option<String>,
    #[serde(default)]
    pub switch_to: Option<MethodKey>,
    #[serde(default)]
    pub method: Option<MethodKey>,
    /// Either a family->package list map, or a named reference into the
    /// package-groups registry (`PackageRef::Named`).
    #[serde(default)]
    pub packages: Option<PackageRef>,
    #[serde(default)]
    pub modifier: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub repo_commands: Option<BTreeMap<PackageManagerKey, Vec<String>>>,
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub fix_commands: Option<Vec<String>>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub dynamic_packages: Option<bool>,
    #[serde(default)]
    pub arch_exclude: Option<Vec<String>>,
}

/// `repo_commands` is keyed by the package-manager method key, not the full
/// `MethodKey` (snap/pip/npm/cargo/go never own a repo_setup step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManagerKey {
    Apt,
    Dnf,
    Yum,
    Apk,
    Pacman,
    Zypper,
    Brew,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackageRef {
    Named(String),
    Explicit(BTreeMap<DistroFamily, Vec<String>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRecord {
    /// Matched case-insensitively against the failed step's stderr.
    pub pattern: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub detect_fn: Option<String>,
    pub failure_id: String,
    pub category: FailureCategory,
    pub label: String,
    pub description: String,
    pub options: Vec<RemediationOptionRecord>,
}

/// A record keyed by `tool_id`, the stable identifier also used as a
/// dependency name (spec.md §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub tool_id: String,
    pub label: String,
    #[serde(default)]
    pub cli: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub risk: Risk,
    pub install: BTreeMap<MethodKey, Vec<String>>,
    pub needs_sudo: BTreeMap<MethodKey, bool>,
    #[serde(default)]
    pub prefer: Vec<MethodKey>,
    #[serde(default)]
    pub requires: Requirements,
    #[serde(default)]
    pub repo_setup: BTreeMap<MethodKey, Vec<StepRecord>>,
    #[serde(default)]
    pub post_env: Option<String>,
    #[serde(default)]
    pub post_install: Vec<StepRecord>,
    #[serde(default)]
    pub verify: Option<Vec<String>>,
    #[serde(default)]
    pub update: BTreeMap<MethodKey, Vec<String>>,
    #[serde(default)]
    pub remove: BTreeMap<MethodKey, Vec<String>>,
    #[serde(default)]
    pub choices: Vec<ChoiceRecord>,
    #[serde(default)]
    pub install_variants: BTreeMap<String, InstallVariant>,
    #[serde(default)]
    pub inputs: Vec<InputRecord>,
    #[serde(default)]
    pub config_templates: Vec<ConfigTemplate>,
    #[serde(default)]
    pub shell_config: Option<ShellConfig>,
    #[serde(default)]
    pub restart_required: Option<RestartRequired>,
    #[serde(default)]
    pub on_failure: Vec<HandlerRecord>,
    #[serde(default)]
    pub arch_map: BTreeMap<String, String>,
}

/// The `install_variants[variant_id]` branch; the spec flags this as in
/// tension with `option.install_command`. Resolution treats `install_command`
/// (inline on the chosen option) as canonical when both are present — see
/// DESIGN.md "Open question: variant resolution".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstallVariant {
    Command(Vec<String>),
    Steps(Vec<StepRecord>),
}

/// A named registry mapping group name -> family -> package list
/// (`build_tools`, `node_build_tools`, `pkg_config`, `epel`, ...).
pub type PackageGroups = BTreeMap<String, BTreeMap<DistroFamily, Vec<String>>>;

/// `KNOWN_PACKAGES[dep][pm]`.
pub type KnownPackages = BTreeMap<String, BTreeMap<PackageManagerKey, String>>;

/// `LIB_TO_PACKAGE_MAP[lib][family]`.
pub type LibToPackageMap = BTreeMap<String, BTreeMap<DistroFamily, String>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_parses_file_exists_with_argument() {
        let cond = Condition::parse("file_exists:/etc/foo").expect("parse");
        assert_eq!(
            cond,
            Condition::FileExists {
                path: "/etc/foo".to_string()
            }
        );
    }

    #[test]
    fn condition_rejects_unknown_token() {
        assert!(Condition::parse("has_unicorn").is_err());
    }

    #[test]
    fn condition_round_trips_the_fixed_vocabulary() {
        for raw in [
            "has_systemd",
            "has_openrc",
            "not_root",
            "is_root",
            "not_container",
            "has_docker",
        ] {
            assert!(Condition::parse(raw).is_ok());
        }
    }

    #[test]
    fn method_key_serializes_default_as_underscore_default() {
        let json = serde_json::to_string(&MethodKey::Default).unwrap();
        assert_eq!(json, "\"_default\"");
    }

    #[test]
    fn package_ref_accepts_named_or_explicit_shape() {
        let named: PackageRef = serde_json::from_str("\"build_tools\"").unwrap();
        assert!(matches!(named, PackageRef::Named(s) if s == "build_tools"));

        let explicit: PackageRef = serde_json::from_str(r#"{"debian": ["curl"]}"#).unwrap();
        assert!(matches!(explicit, PackageRef::Explicit(_)));
    }
}
