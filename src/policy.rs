// Backend policy engine: selection and hysteresis-guarded
// re-evaluation.

#![allow(clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{AutopilotError, AutopilotResult};

/// Where a backend's inference actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwarePath {
    Gpu,
    Cpu,
    Remote,
}

/// The wire shape a backend expects its requests in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    OpenaiCompatible,
    Maas,
}

/// A candidate backend, as resolved by the backend resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCandidate {
    pub backend_id: String,
    pub backend_mode: BackendMode,
    pub hardware_path: HardwarePath,
    pub healthy: Option<bool>,
}

/// Output of backend selection.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub backend_id: String,
    pub backend_mode: BackendMode,
    pub hardware_path: HardwarePath,
    pub fallback_chain: Vec<String>,
    pub reason_codes: Vec<&'static str>,
    pub reevaluate_after_s: u64,
}

/// Select a backend from an ordered tuple of candidates.
pub fn select(candidates: &[BackendCandidate]) -> AutopilotResult<PolicyDecision> {
    if candidates.is_empty() {
        return Err(AutopilotError::EmptyCandidates);
    }

    let mut reason_codes = Vec::new();
    let mut selected_idx = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        if candidate.healthy == Some(false) {
            reason_codes.push("policy.skip.unhealthy");
            continue;
        }
        selected_idx = Some(idx);
        break;
    }

    let selected_idx = match selected_idx {
        Some(idx) => idx,
        None => {
            if !reason_codes.contains(&"policy.skip.unhealthy") {
                reason_codes.push("policy.skip.unhealthy");
            }
            0
        }
    };
    let selected = &candidates[selected_idx];

    let path_reason = match selected.hardware_path {
        HardwarePath::Gpu => "policy.local.gpu-preferred",
        HardwarePath::Cpu => "policy.local.cpu-fallback",
        HardwarePath::Remote => "policy.remote.fallback",
    };
    reason_codes.push(path_reason);

    let fallback_chain: Vec<String> = candidates
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != selected_idx)
        .map(|(_, c)| c.backend_id.clone())
        .collect();

    let reevaluate_after_s = if selected.hardware_path == HardwarePath::Gpu {
        120
    } else {
        30
    };

    Ok(PolicyDecision {
        backend_id: selected.backend_id.clone(),
        backend_mode: selected.backend_mode,
        hardware_path: selected.hardware_path,
        fallback_chain,
        reason_codes,
        reevaluate_after_s,
    })
}

/// Signals that can prompt re-evaluation of the current decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReevalSignal {
    RequestFailed,
    BackendUnhealthy,
    BackendRecovered,
    LatencySpike,
    PeriodicTimer,
    NoChange,
}

impl ReevalSignal {
    fn is_hard_failure(self) -> bool {
        matches!(self, ReevalSignal::RequestFailed | ReevalSignal::BackendUnhealthy)
    }
}

/// Cooldown + flap-window suppression settings.
#[derive(Debug, Clone, Copy)]
pub struct HysteresisSettings {
    pub cooldown_seconds: u64,
    pub flap_window_seconds: u64,
    pub flap_threshold: usize,
}

impl Default for HysteresisSettings {
    fn default() -> Self {
        Self {
            cooldown_seconds: 45,
            flap_window_seconds: 180,
            flap_threshold: 3,
        }
    }
}

/// Suppresses oscillation between backend switches. Process-wide,
/// resettable via an explicit reset hook.
#[derive(Debug, Clone, Default)]
pub struct PolicyRuntimeState {
    pub last_switch_ts: Option<u64>,
    pub switch_timestamps: VecDeque<u64>,
    pub total_suppressions: u64,
    pub cooldown_suppressions: u64,
    pub flap_suppressions: u64,
}

/// Outcome of a re-evaluation decision.
#[derive(Debug, Clone)]
pub struct ReevalOutcome {
    pub should_reevaluate: bool,
    pub reason_code: &'static str,
    pub new_state: PolicyRuntimeState,
    pub cooldown_remaining_s: Option<u64>,
    pub flap_window_count: usize,
    pub hard_failure_bypass: bool,
}

fn base_intent(signal: ReevalSignal, current_path: HardwarePath) -> (&'static str, bool) {
    match signal {
        ReevalSignal::RequestFailed | ReevalSignal::BackendUnhealthy => {
            ("policy.reeval.failure", true)
        }
        ReevalSignal::BackendRecovered => ("policy.reeval.recovered", true),
        ReevalSignal::LatencySpike => {
            if current_path != HardwarePath::Gpu {
                ("policy.reeval.latency", true)
            } else {
                ("policy.reeval.not-required", false)
            }
        }
        ReevalSignal::PeriodicTimer => ("policy.reeval.timer", true),
        ReevalSignal::NoChange => ("policy.reeval.not-required", false),
    }
}

/// Evaluate whether the current decision should be re-evaluated.
/// `now` and `state` are omitted (no context supplied) when the
/// caller wants the bare intent without hysteresis suppression.
pub fn should_reevaluate(
    signal: ReevalSignal,
    current_path: HardwarePath,
    now: Option<u64>,
    state: Option<&PolicyRuntimeState>,
    settings: HysteresisSettings,
) -> ReevalOutcome {
    let (reason, intends) = base_intent(signal, current_path);

    let Some(now) = now else {
        let state = state.cloned().unwrap_or_default();
        return ReevalOutcome {
            should_reevaluate: intends,
            reason_code: reason,
            new_state: state,
            cooldown_remaining_s: None,
            flap_window_count: 0,
            hard_failure_bypass: false,
        };
    };
    let mut state = state.cloned().unwrap_or_default();

    if !intends {
        return ReevalOutcome {
            should_reevaluate: false,
            reason_code: reason,
            new_state: state,
            cooldown_remaining_s: None,
            flap_window_count: state.switch_timestamps.len(),
            hard_failure_bypass: false,
        };
    }

    // Prune switch timestamps outside the flap window.
    let window_start = now.saturating_sub(settings.flap_window_seconds);
    while let Some(&front) = state.switch_timestamps.front() {
        if front < window_start {
            state.switch_timestamps.pop_front();
        } else {
            break;
        }
    }

    if signal.is_hard_failure() {
        let would_have_been_blocked = would_suppress(&state, now, settings);
        state.switch_timestamps.push_back(now);
        state.last_switch_ts = Some(now);
        if would_have_been_blocked {
            state.total_suppressions += 1;
        }
        return ReevalOutcome {
            should_reevaluate: true,
            reason_code: reason,
            flap_window_count: state.switch_timestamps.len(),
            new_state: state,
            cooldown_remaining_s: None,
            hard_failure_bypass: would_have_been_blocked,
        };
    }

    if let Some(last_switch) = state.last_switch_ts {
        let elapsed = now.saturating_sub(last_switch);
        if elapsed < settings.cooldown_seconds {
            state.total_suppressions += 1;
            state.cooldown_suppressions += 1;
            let remaining = (settings.cooldown_seconds - elapsed).max(1);
            return ReevalOutcome {
                should_reevaluate: false,
                reason_code: "policy.reeval.suppressed.cooldown",
                flap_window_count: state.switch_timestamps.len(),
                new_state: state,
                cooldown_remaining_s: Some(remaining),
                hard_failure_bypass: false,
            };
        }
    }

    if state.switch_timestamps.len() >= settings.flap_threshold {
        state.total_suppressions += 1;
        state.flap_suppressions += 1;
        return ReevalOutcome {
            should_reevaluate: false,
            reason_code: "policy.reeval.suppressed.flapping",
            flap_window_count: state.switch_timestamps.len(),
            new_state: state,
            cooldown_remaining_s: None,
            hard_failure_bypass: false,
        };
    }

    state.switch_timestamps.push_back(now);
    state.last_switch_ts = Some(now);
    ReevalOutcome {
        should_reevaluate: true,
        reason_code: reason,
        flap_window_count: state.switch_timestamps.len(),
        new_state: state,
        cooldown_remaining_s: None,
        hard_failure_bypass: false,
    }
}

fn would_suppress(state: &PolicyRuntimeState, now: u64, settings: HysteresisSettings) -> bool {
    if let Some(last_switch) = state.last_switch_ts {
        if now.saturating_sub(last_switch) < settings.cooldown_seconds {
            return true;
        }
    }
    state.switch_timestamps.len() >= settings.flap_threshold
}

/// Resolve settings + capabilities into the ordered candidate tuple
/// fed to [`select`].
pub fn resolve_candidates(
    settings: &crate::config::OcrSettings,
    capabilities: &crate::hardware::HardwareCapabilities,
) -> Vec<BackendCandidate> {
    let mut candidates = Vec::new();

    if settings.local_url.is_some() {
        let hardware_path = match capabilities.preferred_hardware_path() {
            crate::hardware::PreferredPath::Gpu => HardwarePath::Gpu,
            crate::hardware::PreferredPath::Cpu => HardwarePath::Cpu,
        };
        candidates.push(BackendCandidate {
            backend_id: "glm-ocr-local-openai".to_string(),
            backend_mode: BackendMode::OpenaiCompatible,
            hardware_path,
            healthy: None,
        });
    }

    if settings.server_url.is_some() {
        candidates.push(BackendCandidate {
            backend_id: "glm-ocr-remote-openai".to_string(),
            backend_mode: BackendMode::OpenaiCompatible,
            hardware_path: HardwarePath::Remote,
            healthy: None,
        });
    }

    if settings.maas_url.is_some() {
        candidates.push(BackendCandidate {
            backend_id: "glm-ocr-maas".to_string(),
            backend_mode: BackendMode::Maas,
            hardware_path: HardwarePath::Remote,
            healthy: None,
        });
    }

    candidates
}

/// Current UTC epoch seconds, used by callers that don't thread a
/// deterministic clock through tests.
pub fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Process-wide, resettable policy runtime state.
pub struct RuntimeStateHandle(Mutex<PolicyRuntimeState>);

impl RuntimeStateHandle {
    pub const fn new() -> Self {
        Self(Mutex::new(PolicyRuntimeState {
            last_switch_ts: None,
            switch_timestamps: VecDeque::new(),
            total_suppressions: 0,
            cooldown_suppressions: 0,
            flap_suppressions: 0,
        }))
    }

    pub fn snapshot(&self) -> PolicyRuntimeState {
        self.0.lock().expect("policy state lock poisoned").clone()
    }

    pub fn replace(&self, state: PolicyRuntimeState) {
        *self.0.lock().expect("policy state lock poisoned") = state;
    }

    pub fn reset(&self) {
        self.replace(PolicyRuntimeState::default());
    }
}

impl Default for RuntimeStateHandle {
    fn default() -> Self {
        Self::new()
    }
}
