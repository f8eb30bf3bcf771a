//! C1 Host Probe: builds the two-tier [`HostProfile`] from the local system.
//!
//! Every probe here swallows its own failure — a missing file, a binary not
//! on PATH, or a subprocess that errors out all degrade to `None`/`false`
//! rather than propagating. The fast tier is meant to complete in well under
//! 200ms; the deep tier is invoked selectively and cached per category.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use toolctl_types::profile::{
    BuildProfile, Capabilities, ContainerInfo, DeepProfile, DistroFamily, DistroInfo,
    EndpointCheck, FastProfile, FilesystemProfile, GpuDevice, GpuInfo, HostProfile, LibcType,
    LibraryVersions, NetworkProfile, PackageManager, PackageManagerInfo, ProbeCategory,
    SecurityProfile, SystemdState,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEEP_TTL: Duration = Duration::from_secs(300);

static DEEP_TTL_OVERRIDE: OnceLock<Mutex<Option<Duration>>> = OnceLock::new();

/// Overrides the deep-probe cache TTL for every category (`config.rs`'s
/// `[probe]` table). The cache keys entries by category but shares one TTL
/// across them, so the override is global rather than per-category.
pub fn set_deep_ttl_override(ttl: Duration) {
    let cell = DEEP_TTL_OVERRIDE.get_or_init(|| Mutex::new(None));
    *cell.lock().expect("deep ttl override mutex poisoned") = Some(ttl);
}

fn deep_ttl() -> Duration {
    DEEP_TTL_OVERRIDE
        .get()
        .and_then(|cell| *cell.lock().expect("deep ttl override mutex poisoned"))
        .unwrap_or(DEEP_TTL)
}

/// Runs `cmd` with bounded wait; returns `None` on spawn failure, non-UTF8
/// output, or timeout. The child is not forcibly killed on timeout — it is
/// left to exit on its own and its output discarded — matching the spec's
/// requirement that a probe never blocks the overall profile past its budget.
fn run_bounded(cmd: &str, args: &[&str]) -> Option<String> {
    let mut command = Command::new(cmd);
    command.args(args);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let output = command.output();
        let _ = tx.send(output);
    });
    match rx.recv_timeout(PROBE_TIMEOUT) {
        Ok(Ok(output)) if output.status.success() => {
            String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
        }
        _ => None,
    }
}

fn binary_path(name: &str) -> Option<String> {
    which::which(name).ok().map(|p| p.display().to_string())
}

fn read_os_release() -> BTreeMap<String, String> {
    let raw = fs::read_to_string("/etc/os-release").unwrap_or_default();
    let mut map = BTreeMap::new();
    for line in raw.lines() {
        if let Some((key, value)) = line.split_once('=') {
            map.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    map
}

fn parse_version_tuple(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.split(|c: char| c == '.' || c == '-').filter_map(|p| p.parse().ok());
    let major = parts.next()?;
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    Some((major, minor, patch))
}

fn detect_distro() -> DistroInfo {
    let fields = read_os_release();
    let id = fields.get("ID").cloned();
    let id_like = fields.get("ID_LIKE").cloned().unwrap_or_default();
    let family = match id.as_deref() {
        Some("ubuntu") | Some("debian") | Some("linuxmint") | Some("pop") => DistroFamily::Debian,
        Some("fedora") | Some("rhel") | Some("centos") | Some("rocky") | Some("almalinux") => {
            DistroFamily::Rhel
        }
        Some("alpine") => DistroFamily::Alpine,
        Some("arch") | Some("manjaro") | Some("endeavouros") => DistroFamily::Arch,
        Some("opensuse") | Some("opensuse-leap") | Some("sles") => DistroFamily::Suse,
        Some("macos") | Some("darwin") => DistroFamily::Macos,
        _ => {
            if id_like.contains("debian") {
                DistroFamily::Debian
            } else if id_like.contains("rhel") || id_like.contains("fedora") {
                DistroFamily::Rhel
            } else if id_like.contains("suse") {
                DistroFamily::Suse
            } else if cfg!(target_os = "macos") {
                DistroFamily::Macos
            } else {
                DistroFamily::Unknown
            }
        }
    };
    let version = fields.get("VERSION_ID").cloned();
    DistroInfo {
        id,
        name: fields.get("NAME").cloned(),
        version_tuple: version.as_deref().and_then(parse_version_tuple),
        version,
        family,
        codename: fields.get("VERSION_CODENAME").cloned(),
    }
}

fn detect_wsl() -> (bool, Option<u8>) {
    let version_str = fs::read_to_string("/proc/version").unwrap_or_default().to_lowercase();
    if !version_str.contains("microsoft") {
        return (false, None);
    }
    let wsl_version = if version_str.contains("wsl2") { Some(2) } else { Some(1) };
    (true, wsl_version)
}

fn detect_container() -> ContainerInfo {
    let dockerenv = Path::new("/.dockerenv").exists();
    let cgroup = fs::read_to_string("/proc/1/cgroup").unwrap_or_default();
    let runtime = ["docker", "containerd", "crio", "podman", "lxc"]
        .iter()
        .find(|r| cgroup.contains(*r))
        .map(|r| r.to_string());
    let in_k8s = std::env::var("KUBERNETES_SERVICE_HOST").is_ok();
    let environ = fs::read_to_string("/proc/1/environ").unwrap_or_default();
    let environ_hint = environ.contains("container=");
    ContainerInfo {
        in_container: dockerenv || runtime.is_some() || in_k8s || environ_hint,
        runtime,
        in_k8s,
    }
}

fn detect_capabilities() -> Capabilities {
    let has_systemd = binary_path("systemctl").is_some();
    let systemd_state = if has_systemd {
        run_bounded("systemctl", &["is-system-running"]).and_then(|s| match s.as_str() {
            "running" => Some(SystemdState::Running),
            "degraded" => Some(SystemdState::Degraded),
            "starting" => Some(SystemdState::Starting),
            _ => Some(SystemdState::Offline),
        })
    } else {
        None
    };
    let is_root = run_bounded("id", &["-u"]).as_deref() == Some("0");
    let has_sudo = binary_path("sudo").is_some();
    let passwordless_sudo = has_sudo && !is_root && run_bounded("sudo", &["-n", "true"]).is_some();
    Capabilities {
        has_systemd: has_systemd
            && matches!(systemd_state, Some(SystemdState::Running) | Some(SystemdState::Degraded)),
        systemd_state,
        has_sudo,
        passwordless_sudo,
        is_root,
    }
}

fn detect_package_manager(has_systemd: bool) -> PackageManagerInfo {
    let candidates = [
        (PackageManager::Apt, "apt-get"),
        (PackageManager::Dnf, "dnf"),
        (PackageManager::Yum, "yum"),
        (PackageManager::Apk, "apk"),
        (PackageManager::Pacman, "pacman"),
        (PackageManager::Zypper, "zypper"),
        (PackageManager::Brew, "brew"),
    ];
    let available: Vec<PackageManager> = candidates
        .iter()
        .filter(|(_, bin)| binary_path(bin).is_some())
        .map(|(pm, _)| *pm)
        .collect();
    let primary = PackageManager::PRIORITY
        .iter()
        .find(|pm| available.contains(pm))
        .copied();
    let snap_available = has_systemd && binary_path("snap").is_some();
    PackageManagerInfo { primary, available, snap_available }
}

fn detect_libraries() -> LibraryVersions {
    let openssl_version = run_bounded("openssl", &["version"])
        .and_then(|s| s.split_whitespace().nth(1).map(|v| v.to_string()));
    let glibc_version = run_bounded("ldd", &["--version"]).and_then(|s| {
        s.lines().next().and_then(|l| l.split_whitespace().last()).map(|v| v.to_string())
    });
    let libc_type = if fs::metadata("/lib/ld-musl-x86_64.so.1").is_ok()
        || fs::metadata("/lib/ld-musl-aarch64.so.1").is_ok()
    {
        Some(LibcType::Musl)
    } else if glibc_version.is_some() {
        Some(LibcType::Glibc)
    } else if cfg!(target_os = "macos") {
        Some(LibcType::System)
    } else {
        Some(LibcType::Unknown)
    };
    LibraryVersions { openssl_version, glibc_version, libc_type }
}

fn normalize_arch(machine: &str) -> String {
    match machine {
        "x86_64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        "armv7l" | "armv7" => "armv7".to_string(),
        other => other.to_string(),
    }
}

/// Fast tier: always-on, must never raise. Budgeted at well under 200ms on a
/// healthy host — every probe here is either a file read, a `which` lookup,
/// or a single bounded subprocess.
pub fn probe_fast() -> HostProfile {
    let uname = run_bounded("uname", &["-s"]).unwrap_or_default();
    let release = run_bounded("uname", &["-r"]).unwrap_or_default();
    let machine = run_bounded("uname", &["-m"]).unwrap_or_default();
    let (wsl, wsl_version) = detect_wsl();
    let capabilities = detect_capabilities();
    let package_manager = detect_package_manager(capabilities.has_systemd);

    HostProfile {
        fast: FastProfile {
            system: uname,
            release,
            arch: normalize_arch(&machine),
            machine,
            distro: detect_distro(),
            wsl,
            wsl_version,
            container: detect_container(),
            capabilities,
            package_manager,
            libraries: detect_libraries(),
        },
        deep: DeepProfile::default(),
    }
}

/// Caches both the freshness timestamp *and* the probed sub-record per
/// category, so a within-TTL hit can actually serve the cached value back
/// to a caller that starts from a fresh `HostProfile::default()` instead of
/// just skipping the category and leaving it at its zeroed default.
#[derive(Default)]
struct DeepCache {
    recorded_at: BTreeMap<ProbeCategory, Instant>,
    profile: DeepProfile,
}

static DEEP_CACHE: OnceLock<Mutex<DeepCache>> = OnceLock::new();

fn cache() -> &'static Mutex<DeepCache> {
    DEEP_CACHE.get_or_init(|| Mutex::new(DeepCache::default()))
}

fn is_fresh(category: ProbeCategory) -> bool {
    let guard = cache().lock().expect("deep cache mutex poisoned");
    guard.recorded_at.get(&category).is_some_and(|recorded_at| recorded_at.elapsed() < deep_ttl())
}

/// Copies the cached sub-record for `category` into `profile.deep` on a
/// within-TTL hit.
fn serve_cached(profile: &mut HostProfile, category: ProbeCategory) {
    let guard = cache().lock().expect("deep cache mutex poisoned");
    match category {
        ProbeCategory::Shell => profile.deep.shell = guard.profile.shell.clone(),
        ProbeCategory::InitSystem => profile.deep.init_system = guard.profile.init_system.clone(),
        ProbeCategory::Network => profile.deep.network = guard.profile.network.clone(),
        ProbeCategory::Build => profile.deep.build = guard.profile.build.clone(),
        ProbeCategory::Gpu => profile.deep.gpu = guard.profile.gpu.clone(),
        ProbeCategory::Kernel => profile.deep.kernel_modules = guard.profile.kernel_modules.clone(),
        ProbeCategory::WslInterop => profile.deep.wsl_interop = guard.profile.wsl_interop,
        ProbeCategory::Services => profile.deep.services = guard.profile.services.clone(),
        ProbeCategory::Filesystem => profile.deep.filesystem = guard.profile.filesystem.clone(),
        ProbeCategory::Security => profile.deep.security = guard.profile.security.clone(),
    }
}

/// Records a freshly-probed sub-record for `category` plus its timestamp.
fn store_fresh(category: ProbeCategory, profile: &HostProfile) {
    let mut guard = cache().lock().expect("deep cache mutex poisoned");
    match category {
        ProbeCategory::Shell => guard.profile.shell = profile.deep.shell.clone(),
        ProbeCategory::InitSystem => guard.profile.init_system = profile.deep.init_system.clone(),
        ProbeCategory::Network => guard.profile.network = profile.deep.network.clone(),
        ProbeCategory::Build => guard.profile.build = profile.deep.build.clone(),
        ProbeCategory::Gpu => guard.profile.gpu = profile.deep.gpu.clone(),
        ProbeCategory::Kernel => guard.profile.kernel_modules = profile.deep.kernel_modules.clone(),
        ProbeCategory::WslInterop => guard.profile.wsl_interop = profile.deep.wsl_interop,
        ProbeCategory::Services => guard.profile.services = profile.deep.services.clone(),
        ProbeCategory::Filesystem => guard.profile.filesystem = profile.deep.filesystem.clone(),
        ProbeCategory::Security => guard.profile.security = profile.deep.security.clone(),
    }
    guard.recorded_at.insert(category, Instant::now());
}

fn probe_shell() -> Option<String> {
    std::env::var("SHELL").ok()
}

fn probe_init_system(has_systemd: bool) -> Option<String> {
    if has_systemd {
        Some("systemd".to_string())
    } else if binary_path("openrc").is_some() {
        Some("openrc".to_string())
    } else {
        None
    }
}

/// A single dropped packet shouldn't read as "offline" — retries once or
/// twice (spec.md's deep-tier "transient failure" note) before giving up,
/// using the same backoff curve `remediation.rs`'s `retry_with_modifier`
/// options describe to the caller.
fn probe_endpoint(endpoint: &str) -> bool {
    let config = toolctl_retry::RetryStrategyConfig::probe_default();
    let mut attempt = 0;
    loop {
        if run_bounded("curl", &["-sSf", "-o", "/dev/null", "--max-time", "3", endpoint]).is_some() {
            return true;
        }
        attempt += 1;
        match toolctl_retry::calculate_delay(&config, attempt) {
            Some(delay) => thread::sleep(delay),
            None => return false,
        }
    }
}

fn probe_network() -> NetworkProfile {
    let endpoints = ["https://pypi.org", "https://registry.npmjs.org", "https://crates.io"];
    let checks = endpoints
        .iter()
        .map(|endpoint| {
            let started = Instant::now();
            let reachable = probe_endpoint(endpoint);
            EndpointCheck {
                endpoint: endpoint.to_string(),
                reachable,
                latency_ms: reachable.then(|| started.elapsed().as_millis() as u64),
            }
        })
        .collect();
    NetworkProfile { endpoints: checks }
}

fn probe_build() -> BuildProfile {
    let mut compilers = BTreeMap::new();
    for bin in ["gcc", "clang", "cc", "cargo"] {
        if let Some(version) = run_bounded(bin, &["--version"])
            .and_then(|s| s.lines().next().map(|l| l.to_string()))
        {
            compilers.insert(bin.to_string(), version);
        }
    }
    BuildProfile { compilers, pkg_config_available: binary_path("pkg-config").is_some() }
}

fn probe_gpu() -> GpuInfo {
    let nvidia = run_bounded("nvidia-smi", &["--query-gpu=name,driver_version", "--format=csv,noheader"])
        .and_then(|s| {
            let mut parts = s.splitn(2, ',');
            let model = parts.next().map(|m| m.trim().to_string());
            let driver_version = parts.next().map(|d| d.trim().to_string());
            model.map(|model| GpuDevice {
                vendor: "nvidia".to_string(),
                model: Some(model),
                driver_version,
                compute_capability: None,
            })
        });
    GpuInfo { nvidia, amd: None, intel: None }
}

fn probe_kernel() -> Vec<String> {
    fs::read_to_string("/proc/modules")
        .map(|raw| raw.lines().filter_map(|l| l.split_whitespace().next().map(String::from)).collect())
        .unwrap_or_default()
}

fn probe_wsl_interop() -> Option<bool> {
    fs::metadata("/proc/sys/fs/binfmt_misc/WSLInterop").ok().map(|_| true)
}

fn probe_services() -> BTreeMap<String, bool> {
    let mut services = BTreeMap::new();
    for unit in ["docker", "snapd"] {
        let active = run_bounded("systemctl", &["is-active", unit]).as_deref() == Some("active");
        services.insert(unit.to_string(), active);
    }
    services
}

fn probe_filesystem() -> FilesystemProfile {
    let disk_free_bytes = run_bounded("df", &["-k", "--output=avail", "/"]).and_then(|s| {
        s.lines().nth(1).and_then(|l| l.trim().parse::<u64>().ok()).map(|kb| kb * 1024)
    });
    let ram_total_bytes = fs::read_to_string("/proc/meminfo").ok().and_then(|raw| {
        raw.lines().find(|l| l.starts_with("MemTotal")).and_then(|l| {
            l.split_whitespace().nth(1).and_then(|kb| kb.parse::<u64>().ok()).map(|kb| kb * 1024)
        })
    });
    FilesystemProfile { disk_free_bytes, ram_total_bytes }
}

fn probe_security() -> SecurityProfile {
    let selinux_mode = run_bounded("getenforce", &[]).map(|s| s.to_lowercase());
    let apparmor_enabled = Path::new("/sys/module/apparmor/parameters/enabled")
        .exists()
        .then(|| fs::read_to_string("/sys/module/apparmor/parameters/enabled").is_ok_and(|s| s.trim() == "Y"));
    SecurityProfile { selinux_mode, apparmor_enabled }
}

/// Deep tier: selectively invoked by category, TTL-cached. A category whose
/// cache entry is still fresh is served straight from the cache instead of
/// re-probing, so a within-TTL call returns the same sub-record a prior
/// call produced even if `profile` itself started from a fresh default.
pub fn probe_deep(mut profile: HostProfile, needs: &[ProbeCategory]) -> HostProfile {
    for &category in needs {
        if is_fresh(category) {
            serve_cached(&mut profile, category);
            continue;
        }
        match category {
            ProbeCategory::Shell => profile.deep.shell = probe_shell(),
            ProbeCategory::InitSystem => {
                profile.deep.init_system = probe_init_system(profile.fast.capabilities.has_systemd)
            }
            ProbeCategory::Network => profile.deep.network = Some(probe_network()),
            ProbeCategory::Build => profile.deep.build = Some(probe_build()),
            ProbeCategory::Gpu => profile.deep.gpu = Some(probe_gpu()),
            ProbeCategory::Kernel => profile.deep.kernel_modules = probe_kernel(),
            ProbeCategory::WslInterop => profile.deep.wsl_interop = probe_wsl_interop(),
            ProbeCategory::Services => profile.deep.services = probe_services(),
            ProbeCategory::Filesystem => profile.deep.filesystem = Some(probe_filesystem()),
            ProbeCategory::Security => profile.deep.security = Some(probe_security()),
        }
        store_fresh(category, &profile);
    }
    profile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_arch_maps_known_machines() {
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn parse_version_tuple_handles_short_versions() {
        assert_eq!(parse_version_tuple("22.04"), Some((22, 4, 0)));
        assert_eq!(parse_version_tuple("12"), Some((12, 0, 0)));
        assert_eq!(parse_version_tuple("not-a-version"), None);
    }

    #[test]
    fn probe_fast_never_panics_and_is_idempotent() {
        let first = probe_fast();
        let second = probe_fast();
        assert_eq!(first.fast.arch, second.fast.arch);
        assert_eq!(first.fast.distro.family, second.fast.distro.family);
    }

    #[test]
    fn deep_cache_marks_category_fresh_after_probing() {
        let profile = probe_fast();
        let _ = probe_deep(profile.clone(), &[ProbeCategory::Shell]);
        assert!(is_fresh(ProbeCategory::Shell));
    }

    #[test]
    fn deep_cache_serves_the_probed_record_on_a_within_ttl_hit() {
        let base = probe_fast();
        let first = probe_deep(base.clone(), &[ProbeCategory::Gpu]);
        assert!(first.deep.gpu.is_some());

        // Simulates a caller that starts a second call from a fresh profile
        // rather than the one `probe_deep` returned last time; the cached
        // record must still come back rather than a bare skip leaving `gpu`
        // at its zeroed default.
        let fresh_start = HostProfile { fast: base.fast, deep: DeepProfile::default() };
        assert!(is_fresh(ProbeCategory::Gpu));
        let second = probe_deep(fresh_start, &[ProbeCategory::Gpu]);
        assert!(second.deep.gpu.is_some());
    }
}
