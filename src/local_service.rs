// Local service lifecycle manager.
//
// Owns at most one child inference-server process. The critical
// section (lock) spans only stale-reap -> plan build -> spawn ->
// ready-wait; probes and status reads are lock-free, following the
// daemon PID-tracking / terminate-then-kill shape used elsewhere in
// the ambient stack for long-running child processes.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::alias;
use crate::config::OcrSettings;
use crate::endpoint::{self, NormalizedEndpoint};
use crate::hardware::{HardwareCapabilities, PreferredPath};

const TERMINATE_WAIT: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(5);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Action taken by the most recent `ensure_service` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Disabled,
    Reused,
    Started,
    Restarted,
    StartFailed,
    Unavailable,
}

/// Surfaced after every `ensure_service` call.
#[derive(Debug, Clone)]
pub struct LocalServiceStatus {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub healthy: bool,
    pub action: ServiceAction,
    pub reason: Option<String>,
    pub managed: bool,
    pub pid: Option<u32>,
    pub launch_attempts: u32,
    pub restart_count: u32,
    pub startup_ms: Option<u64>,
    pub last_probe_status: Option<u16>,
    pub launch_command: Vec<String>,
    pub hardware_path: Option<PreferredPath>,
    pub model_id: Option<String>,
    pub served_model_name: Option<String>,
}

impl LocalServiceStatus {
    fn disabled() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            healthy: false,
            action: ServiceAction::Disabled,
            reason: None,
            managed: false,
            pid: None,
            launch_attempts: 0,
            restart_count: 0,
            startup_ms: None,
            last_probe_status: None,
            launch_command: Vec::new(),
            hardware_path: None,
            model_id: None,
            served_model_name: None,
        }
    }
}

struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
}

/// Guards a single child process slot. Process-wide; construct one
/// instance and share it (an `Arc` in the caller).
pub struct LocalServiceManager {
    slot: Mutex<Option<ManagedProcess>>,
}

impl Default for LocalServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalServiceManager {
    pub fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    /// Probe the endpoint, starting or restarting the managed process
    /// as needed.
    pub async fn ensure_service(
        &self,
        settings: &OcrSettings,
        capabilities: &HardwareCapabilities,
        client: &reqwest::Client,
    ) -> LocalServiceStatus {
        let Some(raw_url) = settings.local_url.as_deref().filter(|u| !u.is_empty()) else {
            return LocalServiceStatus::disabled();
        };

        let normalized = match endpoint::normalize(raw_url) {
            Ok(n) => n,
            Err(e) => {
                return LocalServiceStatus {
                    enabled: true,
                    healthy: false,
                    action: ServiceAction::Unavailable,
                    reason: Some(format!("invalid-local-url:{e}")),
                    ..LocalServiceStatus::disabled()
                };
            }
        };

        let probe_timeout = Duration::from_secs(settings.local_healthcheck_timeout_s);
        let probe = endpoint::probe(client, &normalized, probe_timeout).await;
        if probe.healthy {
            let managed = self.slot.lock().await.is_some();
            return self.reused_status(&normalized, probe.status, managed);
        }

        if !settings.local_autostart {
            return LocalServiceStatus {
                enabled: true,
                endpoint: Some(normalized.base.clone()),
                healthy: false,
                action: ServiceAction::Unavailable,
                reason: Some("autostart-disabled".to_string()),
                ..LocalServiceStatus::disabled()
            };
        }

        let mut slot = self.slot.lock().await;

        // Double-checked probe now that we hold the lock.
        let probe = endpoint::probe(client, &normalized, probe_timeout).await;
        if probe.healthy {
            let managed = slot.is_some();
            drop(slot);
            return self.reused_status(&normalized, probe.status, managed);
        }

        reap_stale(&mut slot).await;

        let hardware_path = capabilities.preferred_hardware_path();
        let resolved = alias::resolve(&settings.model, &settings.model_aliases);
        let launch_command = build_launch_command(&normalized, &resolved, hardware_path, capabilities);

        let mut launch_attempts = 0u32;
        let mut restart_count = 0u32;
        let start_instant = Instant::now();

        for attempt in 0..=settings.local_max_restarts {
            launch_attempts += 1;
            let spawned = spawn_process(&launch_command).await;
            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    return LocalServiceStatus {
                        enabled: true,
                        endpoint: Some(normalized.base.clone()),
                        healthy: false,
                        action: ServiceAction::StartFailed,
                        reason: Some(format!("spawn-failed:{e}")),
                        launch_attempts,
                        restart_count,
                        launch_command,
                        hardware_path: Some(hardware_path),
                        model_id: Some(resolved.resolved_model.clone()),
                        served_model_name: Some(resolved.served_model_name.clone()),
                        ..LocalServiceStatus::disabled()
                    };
                }
            };
            let pid = child.id();

            let ready = wait_until_ready(
                &mut child,
                client,
                &normalized,
                probe_timeout,
                Duration::from_secs(settings.local_startup_timeout_s),
            )
            .await;

            if ready {
                let startup_ms = start_instant.elapsed().as_millis() as u64;
                *slot = Some(ManagedProcess { child, pid });
                return LocalServiceStatus {
                    enabled: true,
                    endpoint: Some(normalized.base.clone()),
                    healthy: true,
                    action: if attempt == 0 {
                        ServiceAction::Started
                    } else {
                        ServiceAction::Restarted
                    },
                    reason: None,
                    managed: true,
                    pid,
                    launch_attempts,
                    restart_count,
                    startup_ms: Some(startup_ms),
                    last_probe_status: Some(200),
                    launch_command,
                    hardware_path: Some(hardware_path),
                    model_id: Some(resolved.resolved_model.clone()),
                    served_model_name: Some(resolved.served_model_name.clone()),
                };
            }

            terminate_child(&mut child).await;
            restart_count += 1;
        }

        LocalServiceStatus {
            enabled: true,
            endpoint: Some(normalized.base.clone()),
            healthy: false,
            action: ServiceAction::StartFailed,
            reason: Some("startup-timeout".to_string()),
            launch_attempts,
            restart_count,
            launch_command,
            hardware_path: Some(hardware_path),
            model_id: Some(resolved.resolved_model.clone()),
            served_model_name: Some(resolved.served_model_name.clone()),
            ..LocalServiceStatus::disabled()
        }
    }

    fn reused_status(
        &self,
        normalized: &NormalizedEndpoint,
        status: Option<u16>,
        managed: bool,
    ) -> LocalServiceStatus {
        LocalServiceStatus {
            enabled: true,
            endpoint: Some(normalized.base.clone()),
            healthy: true,
            action: ServiceAction::Reused,
            reason: None,
            managed,
            last_probe_status: status,
            ..LocalServiceStatus::disabled()
        }
    }

    /// Terminate the managed process, if any (terminate, wait 5s,
    /// escalate to kill).
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        reap_stale(&mut slot).await;
    }
}

async fn reap_stale(slot: &mut Option<ManagedProcess>) {
    if let Some(mut managed) = slot.take() {
        terminate_child(&mut managed.child).await;
    }
}

/// Terminate-then-kill escalation: SIGTERM, wait up to
/// [`TERMINATE_WAIT`], escalate to SIGKILL on timeout.
async fn terminate_child(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    send_sigterm(child);
    let waited = tokio::time::timeout(TERMINATE_WAIT, child.wait()).await;
    if waited.is_ok() {
        return;
    }
    let _ = child.start_kill();
    let _ = tokio::time::timeout(KILL_WAIT, child.wait()).await;
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

async fn spawn_process(command: &[String]) -> Result<Child, String> {
    let (program, args) = command.split_first().ok_or_else(|| "empty launch command".to_string())?;
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| e.to_string())
}

async fn wait_until_ready(
    child: &mut Child,
    client: &reqwest::Client,
    endpoint: &NormalizedEndpoint,
    probe_timeout: Duration,
    startup_timeout: Duration,
) -> bool {
    let deadline = Instant::now() + startup_timeout;
    loop {
        if let Ok(Some(_)) = child.try_wait() {
            return false;
        }
        let probe = endpoint::probe(client, endpoint, probe_timeout).await;
        if probe.healthy {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(READY_POLL_INTERVAL).await;
    }
}

fn build_launch_command(
    endpoint: &NormalizedEndpoint,
    resolved: &alias::ResolvedModel,
    hardware_path: PreferredPath,
    capabilities: &HardwareCapabilities,
) -> Vec<String> {
    let mut command = vec![
        "python".to_string(),
        "-m".to_string(),
        "vllm.entrypoints.openai.api_server".to_string(),
        "--model".to_string(),
        resolved.resolved_model.clone(),
        "--host".to_string(),
        host_from_netloc(&endpoint.netloc),
        "--port".to_string(),
        port_from_netloc(&endpoint.netloc),
        "--trust-remote-code".to_string(),
        "--max-model-len".to_string(),
        "8192".to_string(),
    ];

    if resolved.served_model_name != resolved.resolved_model {
        command.push("--served-model-name".to_string());
        command.push(resolved.served_model_name.clone());
    }

    match hardware_path {
        PreferredPath::Gpu => {
            let tp_size = capabilities.gpu_count().max(1);
            command.push("--tensor-parallel-size".to_string());
            command.push(tp_size.to_string());
            command.push("--gpu-memory-utilization".to_string());
            command.push("0.90".to_string());
        }
        PreferredPath::Cpu => {
            command.push("--device".to_string());
            command.push("cpu".to_string());
        }
    }

    command
}

fn host_from_netloc(netloc: &str) -> String {
    netloc.split(':').next().unwrap_or("127.0.0.1").to_string()
}

fn port_from_netloc(netloc: &str) -> String {
    netloc.split(':').nth(1).unwrap_or("8000").to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hardware::GpuDevice;

    #[test]
    fn gpu_launch_command_includes_tensor_parallel_flags() {
        let normalized = endpoint::normalize("http://127.0.0.1:8000").unwrap();
        let resolved = alias::resolve("glm-ocr", &Default::default());
        let caps = crate::hardware::synthetic(vec![GpuDevice {
            vendor: "nvidia".to_string(),
            index: 0,
            name: "Test GPU".to_string(),
            memory_mib: 24000,
            driver_version: "550".to_string(),
            runtime_version: String::new(),
        }]);
        let command = build_launch_command(&normalized, &resolved, PreferredPath::Gpu, &caps);
        assert!(command.contains(&"--tensor-parallel-size".to_string()));
        assert!(command.contains(&"--gpu-memory-utilization".to_string()));
        assert!(!command.contains(&"--device".to_string()));
    }

    #[test]
    fn cpu_launch_command_uses_device_flag() {
        let normalized = endpoint::normalize("http://127.0.0.1:8000").unwrap();
        let resolved = alias::resolve("glm-ocr", &Default::default());
        let caps = crate::hardware::synthetic(vec![]);
        let command = build_launch_command(&normalized, &resolved, PreferredPath::Cpu, &caps);
        assert!(command.contains(&"--device".to_string()));
        assert!(command.contains(&"cpu".to_string()));
        assert!(!command.contains(&"--tensor-parallel-size".to_string()));
    }

    #[test]
    fn served_model_name_omitted_when_it_matches_the_resolved_model() {
        let normalized = endpoint::normalize("http://127.0.0.1:8000").unwrap();
        let resolved = alias::resolve("my-private-model", &Default::default());
        let caps = crate::hardware::synthetic(vec![]);
        let command = build_launch_command(&normalized, &resolved, PreferredPath::Cpu, &caps);
        assert!(!command.contains(&"--served-model-name".to_string()));
    }

    #[tokio::test]
    async fn disabled_when_local_url_is_empty() {
        let manager = LocalServiceManager::new();
        let settings = OcrSettings {
            local_url: None,
            ..OcrSettings::default()
        };
        let caps = crate::hardware::synthetic(vec![]);
        let client = reqwest::Client::new();
        let status = manager.ensure_service(&settings, &caps, &client).await;
        assert_eq!(status.action, ServiceAction::Disabled);
        assert!(!status.enabled);
    }
}
