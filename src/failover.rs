// Failover executor.
//
// Walks `[selected, *fallback_chain]` for one batch, consulting the
// circuit breaker registry and local service manager, and emitting a
// structured event per attempt.

#![allow(clippy::expect_used)]

use crate::config::OcrSettings;
use crate::endpoint;
use crate::error::{AutopilotError, AutopilotResult};
use crate::events::{EventKind, EventLog};
use crate::hardware::HardwareCapabilities;
use crate::pipeline::{submit_batch, BatchRunResult, PipelineState};
use crate::policy::{self, BackendCandidate, BackendMode, HardwarePath, PolicyDecision, ReevalSignal};
use crate::retry::with_retry;

/// Run one batch through the failover chain, updating shared state
/// and the event log as it goes.
pub async fn run_batch(
    tile_batch: &crate::batch::TileBatch,
    decision: &PolicyDecision,
    candidates: &[BackendCandidate],
    settings: &OcrSettings,
    capabilities: &HardwareCapabilities,
    state: &PipelineState,
    client: &reqwest::Client,
    event_log: &EventLog,
) -> AutopilotResult<BatchRunResult> {
    let chain: Vec<&BackendCandidate> = std::iter::once(decision.backend_id.as_str())
        .chain(decision.fallback_chain.iter().map(|s| s.as_str()))
        .filter_map(|id| candidates.iter().find(|c| c.backend_id == id))
        .collect();

    let mut last_error: Option<AutopilotError> = None;

    for candidate in chain {
        if state.circuit_breakers.is_open(&candidate.backend_id) {
            event_log.push(
                EventKind::BackendSkipped,
                &candidate.backend_id,
                backend_mode_label(candidate),
                candidate.hardware_path,
                Some("runtime.failover.circuit-open"),
                true,
                None,
            );
            continue;
        }

        event_log.push(
            EventKind::BackendAttempted,
            &candidate.backend_id,
            backend_mode_label(candidate),
            candidate.hardware_path,
            None,
            false,
            None,
        );

        let raw_endpoint = if candidate.hardware_path == HardwarePath::Remote {
            match candidate.backend_mode {
                BackendMode::Maas => settings.maas_url.clone(),
                BackendMode::OpenaiCompatible => settings.server_url.clone(),
            }
        } else {
            let status = state
                .local_service
                .ensure_service(settings, capabilities, client)
                .await;
            if !status.healthy {
                event_log.push(
                    EventKind::BackendFailed,
                    &candidate.backend_id,
                    backend_mode_label(candidate),
                    candidate.hardware_path,
                    Some("runtime.failover.local-unhealthy"),
                    false,
                    None,
                );
                state
                    .circuit_breakers
                    .record_failure(&candidate.backend_id, "local-unhealthy");
                let mut policy_state = state.policy_state.lock().expect("policy state lock poisoned");
                let outcome = policy::should_reevaluate(
                    ReevalSignal::BackendUnhealthy,
                    candidate.hardware_path,
                    Some(policy::now_epoch_s()),
                    Some(&policy_state),
                    state.hysteresis,
                );
                *policy_state = outcome.new_state;
                last_error = Some(AutopilotError::LocalServiceUnavailable(
                    status.reason.unwrap_or_else(|| "unknown".to_string()),
                ));
                continue;
            }
            status.endpoint
        };

        let Some(raw_endpoint) = raw_endpoint else {
            event_log.push(
                EventKind::BackendFailed,
                &candidate.backend_id,
                backend_mode_label(candidate),
                candidate.hardware_path,
                Some("runtime.failover.transport-error"),
                false,
                None,
            );
            last_error = Some(AutopilotError::Config(format!(
                "no endpoint configured for backend {}",
                candidate.backend_id
            )));
            continue;
        };

        // The local manager already hands back a normalized base, but
        // renormalizing is idempotent and is the only place a remote or
        // MaaS URL gets the same dispatch-shape detection applied to it.
        let normalized = match endpoint::normalize(&raw_endpoint) {
            Ok(n) => n,
            Err(e) => {
                event_log.push(
                    EventKind::BackendFailed,
                    &candidate.backend_id,
                    backend_mode_label(candidate),
                    candidate.hardware_path,
                    "runtime.failover.transport-error",
                    false,
                    None,
                );
                last_error = Some(e);
                continue;
            }
        };

        let api_key = match candidate.backend_mode {
            BackendMode::Maas => settings.maas_api_key.as_deref().or(settings.api_key.as_deref()),
            BackendMode::OpenaiCompatible => settings.api_key.as_deref(),
        };

        let is_local = candidate.hardware_path != HardwarePath::Remote;
        let attempt_result = with_retry(|attempt| {
            submit_batch(
                client,
                &normalized.base,
                normalized.dispatch,
                api_key,
                is_local,
                candidate.backend_mode,
                &settings.model,
                settings.use_fp8,
                tile_batch,
                attempt,
            )
        })
        .await;

        match attempt_result {
            Ok((run, _attempts)) => {
                event_log.push(
                    EventKind::BackendSucceeded,
                    &candidate.backend_id,
                    backend_mode_label(candidate),
                    candidate.hardware_path,
                    None,
                    false,
                    Some(run.http_status),
                );
                state.circuit_breakers.record_success(&candidate.backend_id);
                return Ok(run);
            }
            Err(e) => {
                let reason_code = match &e {
                    AutopilotError::RetriesExhausted { .. } | AutopilotError::Http { .. } => {
                        "runtime.failover.http-error"
                    }
                    _ => "runtime.failover.transport-error",
                };
                let status = if let AutopilotError::Http { status, .. } = &e {
                    Some(*status)
                } else {
                    None
                };
                event_log.push(
                    EventKind::BackendFailed,
                    &candidate.backend_id,
                    backend_mode_label(candidate),
                    candidate.hardware_path,
                    Some(reason_code),
                    false,
                    status,
                );
                state.circuit_breakers.record_failure(&candidate.backend_id, reason_code);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| AutopilotError::AllBackendsFailed("no candidates attempted".to_string())))
}

fn backend_mode_label(candidate: &BackendCandidate) -> &'static str {
    match candidate.backend_mode {
        policy::BackendMode::OpenaiCompatible => "openai-compatible",
        policy::BackendMode::Maas => "maas",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{BackendMode, PolicyDecision};

    fn candidate(id: &str, path: HardwarePath) -> BackendCandidate {
        BackendCandidate {
            backend_id: id.to_string(),
            backend_mode: BackendMode::OpenaiCompatible,
            hardware_path: path,
            healthy: None,
        }
    }

    #[tokio::test]
    async fn skips_open_circuit_and_records_event() {
        let settings = OcrSettings {
            server_url: Some("http://127.0.0.1:1".to_string()),
            ..OcrSettings::default()
        };
        let state = PipelineState::new(None);
        state.circuit_breakers.record_failure("glm-ocr-remote-openai", "x");
        state.circuit_breakers.record_failure("glm-ocr-remote-openai", "x");

        let candidates = vec![candidate("glm-ocr-remote-openai", HardwarePath::Remote)];
        let decision = PolicyDecision {
            backend_id: "glm-ocr-remote-openai".to_string(),
            backend_mode: BackendMode::OpenaiCompatible,
            hardware_path: HardwarePath::Remote,
            fallback_chain: Vec::new(),
            reason_codes: vec!["policy.remote.fallback"],
            reevaluate_after_s: 30,
        };
        let caps = crate::hardware::synthetic(vec![]);
        let client = reqwest::Client::new();
        let log = EventLog::new();
        let tile_batch = crate::batch::TileBatch {
            tiles: vec![crate::batch::TileRequest {
                tile_id: "a".to_string(),
                image_bytes: vec![1, 2, 3],
                model_override: None,
            }],
            model: None,
        };

        let result = run_batch(&tile_batch, &decision, &candidates, &settings, &caps, &state, &client, &log).await;
        assert!(result.is_err());
        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::BackendSkipped);
        assert_eq!(events[0].reason_code.as_deref(), Some("runtime.failover.circuit-open"));
    }
}
