use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Coarse grouping used for package naming and recipe `requires.packages` lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistroFamily {
    Debian,
    Rhel,
    Alpine,
    Arch,
    Suse,
    Macos,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DistroInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub version_tuple: Option<(u32, u32, u32)>,
    pub family: DistroFamily,
    pub codename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemdState {
    Running,
    Degraded,
    Offline,
    Starting,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Capabilities {
    pub has_systemd: bool,
    pub systemd_state: Option<SystemdState>,
    pub has_sudo: bool,
    pub passwordless_sudo: bool,
    pub is_root: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerInfo {
    pub in_container: bool,
    pub runtime: Option<String>,
    pub in_k8s: bool,
}

/// First-found system package manager, in the fixed priority order
/// `apt, dnf, yum, apk, pacman, zypper, brew`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Apk,
    Pacman,
    Zypper,
    Brew,
}

impl PackageManager {
    /// Fixed detection priority order used to pick the "primary" package manager.
    pub const PRIORITY: [PackageManager; 7] = [
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Apk,
        PackageManager::Pacman,
        PackageManager::Zypper,
        PackageManager::Brew,
    ];

    pub fn binary_name(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Apk => "apk",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
            PackageManager::Brew => "brew",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackageManagerInfo {
    pub primary: Option<PackageManager>,
    pub available: Vec<PackageManager>,
    pub snap_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibcType {
    Glibc,
    Musl,
    System,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LibraryVersions {
    pub openssl_version: Option<String>,
    pub glibc_version: Option<String>,
    pub libc_type: Option<LibcType>,
}

/// Fast-tier fields: always produced, must complete in well under 200ms on a
/// healthy host, and must never fail the overall probe (missing data is
/// `None`/`false`, never a propagated error).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FastProfile {
    pub system: String,
    pub release: String,
    pub machine: String,
    pub arch: String,
    pub distro: DistroInfo,
    pub wsl: bool,
    pub wsl_version: Option<u8>,
    pub container: ContainerInfo,
    pub capabilities: Capabilities,
    pub package_manager: PackageManagerInfo,
    pub libraries: LibraryVersions,
}

/// Independently-invalidated deep-tier probe category. `needs: Set<ProbeCategory>`
/// selects which categories a `probe_deep` call refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeCategory {
    Shell,
    InitSystem,
    Network,
    Build,
    Gpu,
    Kernel,
    WslInterop,
    Services,
    Filesystem,
    Security,
}

impl ProbeCategory {
    pub const ALL: [ProbeCategory; 10] = [
        ProbeCategory::Shell,
        ProbeCategory::InitSystem,
        ProbeCategory::Network,
        ProbeCategory::Build,
        ProbeCategory::Gpu,
        ProbeCategory::Kernel,
        ProbeCategory::WslInterop,
        ProbeCategory::Services,
        ProbeCategory::Filesystem,
        ProbeCategory::Security,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpuDevice {
    pub vendor: String,
    pub model: Option<String>,
    pub driver_version: Option<String>,
    pub compute_capability: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpuInfo {
    pub nvidia: Option<GpuDevice>,
    pub amd: Option<GpuDevice>,
    pub intel: Option<GpuDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointCheck {
    pub endpoint: String,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkProfile {
    pub endpoints: Vec<EndpointCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BuildProfile {
    /// Compiler binary name -> detected version.
    pub compilers: BTreeMap<String, String>,
    pub pkg_config_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityProfile {
    pub selinux_mode: Option<String>,
    pub apparmor_enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FilesystemProfile {
    pub disk_free_bytes: Option<u64>,
    pub ram_total_bytes: Option<u64>,
}

/// A single deep-tier probe's cached result plus the instant it was recorded,
/// so a consumer can decide whether it is still within TTL.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeepProfile {
    pub shell: Option<String>,
    pub init_system: Option<String>,
    pub network: Option<NetworkProfile>,
    pub build: Option<BuildProfile>,
    pub gpu: Option<GpuInfo>,
    pub kernel_modules: Vec<String>,
    pub wsl_interop: Option<bool>,
    pub services: BTreeMap<String, bool>,
    pub filesystem: Option<FilesystemProfile>,
    pub security: Option<SecurityProfile>,
}

/// Structured snapshot of host capabilities, in two tiers. The fast tier is
/// produced unconditionally by `probe_fast`; the deep tier is filled in
/// selectively by `probe_deep(profile, needs)`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostProfile {
    pub fast: FastProfile,
    pub deep: DeepProfile,
}

impl HostProfile {
    pub fn arch(&self) -> &str {
        &self.fast.arch
    }

    pub fn distro_family(&self) -> DistroFamily {
        self.fast.distro.family
    }

    pub fn primary_pm(&self) -> Option<PackageManager> {
        self.fast.package_manager.primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_manager_priority_is_apt_first() {
        assert_eq!(PackageManager::PRIORITY[0], PackageManager::Apt);
        assert_eq!(PackageManager::PRIORITY[6], PackageManager::Brew);
    }

    #[test]
    fn default_host_profile_has_unknown_family_and_no_pm() {
        let profile = HostProfile::default();
        assert_eq!(profile.distro_family(), DistroFamily::Unknown);
        assert!(profile.primary_pm().is_none());
    }

    #[test]
    fn host_profile_roundtrips_json() {
        let mut profile = HostProfile::default();
        profile.fast.arch = "amd64".to_string();
        profile.fast.distro.family = DistroFamily::Debian;
        profile.fast.package_manager.primary = Some(PackageManager::Apt);

        let json = serde_json::to_string(&profile).expect("serialize");
        let parsed: HostProfile = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.arch(), "amd64");
        assert_eq!(parsed.distro_family(), DistroFamily::Debian);
        assert_eq!(parsed.primary_pm(), Some(PackageManager::Apt));
    }
}
