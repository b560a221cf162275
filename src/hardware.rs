// Hardware capability detection.
//
// Produces a process-wide, immutable snapshot of CPU/memory/GPU
// presence. Detection is best-effort: a missing `nvidia-smi` binary
// or a parse failure degrades to "no GPU" rather than failing the
// caller, since the policy engine treats `cpu` as a safe default path.

#![allow(clippy::expect_used)]

use std::process::Command;
use std::sync::RwLock;

/// A single detected GPU device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub vendor: String,
    pub index: u32,
    pub name: String,
    pub memory_mib: u64,
    pub driver_version: String,
    pub runtime_version: String,
}

/// Where inference should prefer to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredPath {
    Gpu,
    Cpu,
}

/// Immutable, process-wide hardware capability snapshot.
#[derive(Debug, Clone)]
pub struct HardwareCapabilities {
    pub platform: String,
    pub arch: String,
    pub physical_cpus: usize,
    pub logical_cpus: usize,
    pub total_memory_mib: u64,
    pub available_memory_mib: u64,
    pub gpus: Vec<GpuDevice>,
    pub detection_sources: Vec<String>,
    pub detection_warnings: Vec<String>,
}

impl HardwareCapabilities {
    /// `gpu` iff at least one GPU device was detected.
    pub fn preferred_hardware_path(&self) -> PreferredPath {
        if self.gpus.is_empty() {
            PreferredPath::Cpu
        } else {
            PreferredPath::Gpu
        }
    }

    pub fn gpu_count(&self) -> usize {
        self.gpus.len()
    }

    fn detect() -> Self {
        let mut sources = Vec::new();
        let mut warnings = Vec::new();

        let physical_cpus = num_cpus_physical();
        let logical_cpus = num_cpus_logical();
        sources.push("stdlib::cpu-count".to_string());

        let (total_memory_mib, available_memory_mib) = match read_meminfo_mib() {
            Some(pair) => {
                sources.push("/proc/meminfo".to_string());
                pair
            }
            None => {
                warnings.push("meminfo-unavailable".to_string());
                (0, 0)
            }
        };

        let gpus = match probe_nvidia_smi() {
            Ok(devices) if !devices.is_empty() => {
                sources.push("nvidia-smi".to_string());
                devices
            }
            Ok(_) => Vec::new(),
            Err(reason) => {
                warnings.push(format!("gpu-probe-failed:{reason}"));
                Vec::new()
            }
        };

        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            physical_cpus,
            logical_cpus,
            total_memory_mib,
            available_memory_mib,
            gpus,
            detection_sources: sources,
            detection_warnings: warnings,
        }
    }
}

static CAPABILITIES: RwLock<Option<HardwareCapabilities>> = RwLock::new(None);

/// Return the cached, process-wide capability snapshot, detecting on
/// first use.
pub fn capabilities() -> HardwareCapabilities {
    if let Some(caps) = CAPABILITIES.read().expect("capabilities lock poisoned").as_ref() {
        return caps.clone();
    }
    let detected = HardwareCapabilities::detect();
    let mut slot = CAPABILITIES.write().expect("capabilities lock poisoned");
    if slot.is_none() {
        *slot = Some(detected.clone());
    }
    detected
}

/// Reset the cached snapshot so the next `capabilities()` call
/// re-detects. Reserved for tests.
pub fn reset_capabilities() {
    *CAPABILITIES.write().expect("capabilities lock poisoned") = None;
}

/// Test-only: build a capability snapshot directly.
#[cfg(test)]
pub fn synthetic(gpus: Vec<GpuDevice>) -> HardwareCapabilities {
    HardwareCapabilities {
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        physical_cpus: 1,
        logical_cpus: 1,
        total_memory_mib: 1024,
        available_memory_mib: 512,
        gpus,
        detection_sources: vec!["synthetic".to_string()],
        detection_warnings: Vec::new(),
    }
}

fn num_cpus_physical() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn num_cpus_logical() -> usize {
    num_cpus_physical()
}

fn read_meminfo_mib() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kib = None;
    let mut available_kib = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kib = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kib = parse_kib(rest);
        }
    }
    Some((total_kib? / 1024, available_kib.unwrap_or(0) / 1024))
}

fn parse_kib(rest: &str) -> Option<u64> {
    rest.trim().split_whitespace().next()?.parse().ok()
}

fn probe_nvidia_smi() -> Result<Vec<GpuDevice>, String> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,driver_version",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err(format!("nvidia-smi exited with {:?}", output.status.code()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut devices = Vec::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 4 {
            continue;
        }
        let index: u32 = parts[0].parse().unwrap_or(0);
        let memory_mib: u64 = parts[2].parse().unwrap_or(0);
        devices.push(GpuDevice {
            vendor: "nvidia".to_string(),
            index,
            name: parts[1].to_string(),
            memory_mib,
            driver_version: parts[3].to_string(),
            runtime_version: String::new(),
        });
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_path_is_gpu_when_devices_present() {
        let caps = synthetic(vec![GpuDevice {
            vendor: "nvidia".to_string(),
            index: 0,
            name: "Test GPU".to_string(),
            memory_mib: 24000,
            driver_version: "550.0".to_string(),
            runtime_version: String::new(),
        }]);
        assert_eq!(caps.preferred_hardware_path(), PreferredPath::Gpu);
        assert_eq!(caps.gpu_count(), 1);
    }

    #[test]
    fn preferred_path_is_cpu_when_no_devices() {
        let caps = synthetic(vec![]);
        assert_eq!(caps.preferred_hardware_path(), PreferredPath::Cpu);
        assert_eq!(caps.gpu_count(), 0);
    }

    #[test]
    fn capabilities_singleton_is_stable_until_reset() {
        reset_capabilities();
        let first = capabilities();
        let second = capabilities();
        assert_eq!(first.detection_sources, second.detection_sources);
        reset_capabilities();
    }
}
