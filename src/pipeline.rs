// OCR submission pipeline.
//
// `submit_tiles` is the crate's single entry point: batches tiles,
// drives them through the failover executor under a concurrency
// gate, and assembles the final result.

use std::time::Duration;

use base64::prelude::{Engine, BASE64_STANDARD};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::batch::{self, TileBatch, TileRequest};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::concurrency::{BatchOutcome, ConcurrencyController};
use crate::config::OcrSettings;
use crate::endpoint::DispatchShape;
use crate::error::{AutopilotError, AutopilotResult};
use crate::events::EventLog;
use crate::failover;
use crate::hardware::HardwareCapabilities;
use crate::local_service::LocalServiceManager;
use crate::metrics::{BatchTelemetry, MetricsCollector};
use crate::policy::{self, BackendMode, HysteresisSettings, PolicyRuntimeState};
use crate::quota::QuotaTracker;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const POOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Prompt sent alongside each tile image in the openai-compatible path.
const OCR_PROMPT: &str = "Transcribe all text visible in this image tile as Markdown.";

/// Mutable state threaded through every `submit_tiles` call. The
/// pipeline owns these singletons; the policy engine stays pure.
pub struct PipelineState {
    pub circuit_breakers: CircuitBreakerRegistry,
    pub quota: QuotaTracker,
    pub policy_state: std::sync::Mutex<PolicyRuntimeState>,
    pub local_service: LocalServiceManager,
    pub hysteresis: HysteresisSettings,
}

impl PipelineState {
    pub fn new(daily_quota_tiles: Option<u64>) -> Self {
        Self {
            circuit_breakers: CircuitBreakerRegistry::new(),
            quota: QuotaTracker::new(daily_quota_tiles),
            policy_state: std::sync::Mutex::new(PolicyRuntimeState::default()),
            local_service: LocalServiceManager::new(),
            hysteresis: HysteresisSettings::default(),
        }
    }
}

/// Final result of one `submit_tiles` call.
pub struct SubmissionResult {
    pub markdown_chunks: Vec<String>,
    pub batches: usize,
    pub telemetry: Vec<BatchTelemetry>,
    pub quota: crate::quota::QuotaStatus,
    pub peak_concurrency: usize,
    pub final_concurrency: usize,
    pub adjustment_events: Vec<crate::concurrency::AdjustmentEvent>,
    pub failover_events: Vec<crate::events::FailoverEvent>,
    pub backend_id: String,
}

/// Entry point: submit a batch of tile requests for OCR.
pub async fn submit_tiles(
    requests: Vec<TileRequest>,
    settings: &OcrSettings,
    capabilities: &HardwareCapabilities,
    state: &PipelineState,
    client: Option<reqwest::Client>,
) -> AutopilotResult<SubmissionResult> {
    if requests.is_empty() {
        return Ok(SubmissionResult {
            markdown_chunks: Vec::new(),
            batches: 0,
            telemetry: Vec::new(),
            quota: state.quota.status(),
            peak_concurrency: 0,
            final_concurrency: 0,
            adjustment_events: Vec::new(),
            failover_events: Vec::new(),
            backend_id: String::new(),
        });
    }

    let client = client.unwrap_or_else(default_client);

    let order: Vec<String> = requests.iter().map(|t| t.tile_id.clone()).collect();
    let mut markdown_by_id: std::collections::HashMap<String, String> =
        order.iter().map(|id| (id.clone(), String::new())).collect();

    let candidates = policy::resolve_candidates(settings, capabilities);
    let decision = policy::select(&candidates)?;

    let tile_batches: Vec<TileBatch> = batch::group_tiles(requests, settings.max_batch_tiles, settings.max_batch_bytes);
    let batch_count = tile_batches.len();

    let mut controller = ConcurrencyController::new(
        settings.min_concurrency,
        settings.max_concurrency,
        Duration::from_millis(5000),
    );
    // A counting semaphore gates how many batches are in flight at
    // once; its capacity tracks the controller's adaptive limit as
    // each batch completes, so the AIMD decision actually throttles
    // concurrent dispatch rather than just being recorded after the
    // fact. Futures are driven on this task rather than spawned: the
    // scheduling model is single-threaded cooperative concurrency,
    // not OS-thread parallelism.
    let semaphore = Semaphore::new(controller.current_limit());
    let mut granted_limit = controller.current_limit();
    let metrics = MetricsCollector::default();
    let event_log = EventLog::new();
    let mut last_error: Option<AutopilotError> = None;

    let semaphore_ref = &semaphore;
    let decision_ref = &decision;
    let candidates_ref = &candidates;
    let client_ref = &client;
    let event_log_ref = &event_log;

    let mut pending = FuturesUnordered::new();
    for tile_batch in tile_batches {
        pending.push(async move {
            let _permit = semaphore_ref.acquire().await.map_err(|e| AutopilotError::Internal(e.to_string()))?;
            failover::run_batch(
                &tile_batch,
                decision_ref,
                candidates_ref,
                settings,
                capabilities,
                state,
                client_ref,
                event_log_ref,
            )
            .await
        });
    }

    while let Some(outcome) = pending.next().await {
        match outcome {
            Ok(run) => {
                for (id, markdown) in run.markdown_by_tile {
                    markdown_by_id.insert(id, markdown);
                }
                state.quota.record(tile_batch_tile_count(&run.tile_ids));
                metrics.record_batch(BatchTelemetry {
                    tile_ids: run.tile_ids,
                    latency_ms: run.latency.as_millis() as u64,
                    http_status: run.http_status,
                    request_id: run.request_id,
                    payload_bytes: run.payload_bytes,
                    attempts: run.attempts,
                });
                metrics.record_request(true);
                controller.record(BatchOutcome {
                    http_status: run.http_status,
                    latency: run.latency,
                    attempts: run.attempts,
                });
                adjust_semaphore(&semaphore, &mut granted_limit, controller.current_limit());
            }
            Err(e) => {
                metrics.record_request(false);
                last_error = Some(e);
            }
        }
    }
    drop(pending);

    if let Some(e) = last_error {
        if markdown_by_id.values().all(|v| v.is_empty()) {
            return Err(AutopilotError::AllBackendsFailed(e.to_string()));
        }
    }

    let markdown_chunks: Vec<String> = order.iter().map(|id| markdown_by_id.remove(id).unwrap_or_default()).collect();

    Ok(SubmissionResult {
        markdown_chunks,
        batches: batch_count,
        telemetry: metrics.batches(),
        quota: state.quota.status(),
        peak_concurrency: controller.peak_limit(),
        final_concurrency: controller.final_limit(),
        adjustment_events: controller.events().to_vec(),
        failover_events: event_log.into_events(),
        backend_id: decision.backend_id,
    })
}

fn tile_batch_tile_count(tile_ids: &[String]) -> u64 {
    tile_ids.len() as u64
}

/// Resize the concurrency gate to match a new AIMD limit.
///
/// `granted` tracks the semaphore capacity this function has actually
/// achieved so far (not just the last target), so a shrink that can't
/// fully apply yet — because batches holding those permits haven't
/// completed — is retried against the right baseline next time rather
/// than being silently dropped. Growing always succeeds outright.
fn adjust_semaphore(semaphore: &Semaphore, granted: &mut usize, target: usize) {
    if target > *granted {
        semaphore.add_permits(target - *granted);
        *granted = target;
    } else if target < *granted {
        if let Ok(permits) = semaphore.try_acquire_many((*granted - target) as u32) {
            permits.forget();
            *granted = target;
        }
    }
}

fn default_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .pool_idle_timeout(POOL_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Result of one successful `_submit_batch` attempt, ready to be
/// merged into the overall submission result.
pub struct BatchRunResult {
    pub markdown_by_tile: Vec<(String, String)>,
    pub tile_ids: Vec<String>,
    pub latency: Duration,
    pub http_status: u16,
    pub request_id: Option<String>,
    pub payload_bytes: usize,
    pub attempts: u32,
}

/// Attempt a single batch against one backend. Retries are handled by
/// the caller (`failover::run_batch`) through
/// [`crate::retry::with_retry`].
pub async fn submit_batch(
    client: &reqwest::Client,
    endpoint_base: &str,
    dispatch: DispatchShape,
    api_key: Option<&str>,
    is_local: bool,
    backend_mode: BackendMode,
    model: &str,
    use_fp8: bool,
    tile_batch: &TileBatch,
    attempt: u32,
) -> AutopilotResult<BatchRunResult> {
    let timer = crate::metrics::LatencyTimer::start();

    let payload = build_payload(backend_mode, dispatch, model, use_fp8, tile_batch)?;
    let payload_bytes = serde_json::to_vec(&payload).map(|v| v.len()).unwrap_or(0);

    let url = dispatch_url(endpoint_base, backend_mode, dispatch);
    let mut request = client.post(&url).header("Content-Type", "application/json").json(&payload);
    if let (Some(key), false) = (api_key, is_local) {
        request = request.header("Authorization", format!("Bearer {key}"));
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        return Err(AutopilotError::Http { status, body });
    }

    let body: Value = response.json().await.map_err(|e| AutopilotError::MalformedResponse(e.to_string()))?;
    let request_id = request_id
        .or_else(|| body.get("request_id").and_then(|v| v.as_str()).map(|s| s.to_string()))
        .or_else(|| Some(uuid::Uuid::new_v4().to_string()));

    let markdown_by_tile = normalize_response(&body, tile_batch)?;
    let tile_ids = tile_batch.tile_ids();

    Ok(BatchRunResult {
        markdown_by_tile,
        tile_ids,
        latency: timer.elapsed(),
        http_status: status,
        request_id,
        payload_bytes,
        attempts: attempt,
    })
}

/// Dispatch target per backend mode and wire shape. `OpenaiCompatible`
/// alternates between the chat-completions endpoint and the legacy
/// `/ocr` batch endpoint depending on how the configured URL was
/// normalized; MaaS always dispatches to `/ocr`.
fn dispatch_url(endpoint_base: &str, backend_mode: BackendMode, dispatch: DispatchShape) -> String {
    match (backend_mode, dispatch) {
        (BackendMode::OpenaiCompatible, DispatchShape::Chat) => format!("{endpoint_base}/chat/completions"),
        (BackendMode::OpenaiCompatible, DispatchShape::LegacyBatch) => format!("{endpoint_base}/ocr"),
        (BackendMode::Maas, _) => format!("{endpoint_base}/ocr"),
    }
}

fn build_payload(
    backend_mode: BackendMode,
    dispatch: DispatchShape,
    model: &str,
    use_fp8: bool,
    tile_batch: &TileBatch,
) -> AutopilotResult<Value> {
    let model = tile_batch.model.clone().unwrap_or_else(|| model.to_string());

    // The legacy batch shape carries every tile in the group in one
    // request and already embeds `options.fp8`; the chat and MaaS
    // shapes carry a single representative tile and get `options.fp8`
    // tacked on below when requested.
    if backend_mode == BackendMode::OpenaiCompatible && dispatch == DispatchShape::LegacyBatch {
        let input: Vec<Value> = tile_batch
            .tiles
            .iter()
            .map(|tile| {
                let b64 = BASE64_STANDARD.encode(&tile.image_bytes);
                json!({"id": tile.tile_id, "image": b64})
            })
            .collect();
        return Ok(json!({
            "model": model,
            "input": input,
            "options": {"fp8": use_fp8},
        }));
    }

    let tile = tile_batch.tiles.first().ok_or_else(|| AutopilotError::EmptyCandidates)?;
    let b64 = BASE64_STANDARD.encode(&tile.image_bytes);
    let mut payload = match backend_mode {
        BackendMode::OpenaiCompatible => json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": OCR_PROMPT},
                    {"type": "image_url", "image_url": {"url": format!("data:image/png;base64,{b64}")}},
                ],
            }],
            "max_tokens": 4096,
            "temperature": 0.0,
        }),
        BackendMode::Maas => json!({
            "model": model,
            "file": format!("data:image/png;base64,{b64}"),
        }),
    };
    if use_fp8 {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("options".to_string(), json!({"fp8": true}));
        }
    }
    Ok(payload)
}

/// Normalize accepted response shapes.
fn normalize_response(body: &Value, tile_batch: &TileBatch) -> AutopilotResult<Vec<(String, String)>> {
    let tile_ids = tile_batch.tile_ids();
    let n = tile_ids.len();

    if let Some(array) = body.get("results").and_then(|v| v.as_array()) {
        return extract_multi(array, &tile_ids, "markdown");
    }
    if let Some(array) = body.get("data").and_then(|v| v.as_array()) {
        return extract_multi(array, &tile_ids, "content");
    }

    if n == 1 {
        if let Some(choices) = body.get("choices").and_then(|v| v.as_array()) {
            let content = choices
                .first()
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .ok_or_else(|| AutopilotError::MalformedResponse("missing choices[0].message.content".to_string()))?;
            let markdown = extract_content(content)?;
            return Ok(vec![(tile_ids[0].clone(), markdown)]);
        }
        if let Some(markdown) = body.get("markdown").and_then(|v| v.as_str()) {
            return Ok(vec![(tile_ids[0].clone(), markdown.to_string())]);
        }
    }

    Err(AutopilotError::MalformedResponse(
        "response did not match any accepted shape".to_string(),
    ))
}

fn extract_multi(array: &[Value], tile_ids: &[String], field: &str) -> AutopilotResult<Vec<(String, String)>> {
    if array.len() < tile_ids.len() {
        return Err(AutopilotError::MalformedResponse(format!(
            "expected at least {} results, got {}",
            tile_ids.len(),
            array.len()
        )));
    }
    tile_ids
        .iter()
        .zip(array.iter())
        .map(|(id, entry)| {
            let markdown = entry
                .get(field)
                .and_then(|v| v.as_str())
                .ok_or_else(|| AutopilotError::MalformedResponse(format!("missing field '{field}' in response entry")))?;
            Ok((id.clone(), markdown.to_string()))
        })
        .collect()
}

fn extract_content(content: &Value) -> AutopilotResult<String> {
    if let Some(s) = content.as_str() {
        return Ok(s.to_string());
    }
    if let Some(parts) = content.as_array() {
        let joined: Vec<String> = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .map(|s| s.to_string())
            .collect();
        if !joined.is_empty() {
            return Ok(joined.join("\n"));
        }
    }
    Err(AutopilotError::MalformedResponse("unrecognized message content shape".to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tile(id: &str) -> TileRequest {
        TileRequest {
            tile_id: id.to_string(),
            image_bytes: vec![1, 2, 3],
            model_override: None,
        }
    }

    #[test]
    fn normalizes_results_array_shape() {
        let batch = TileBatch { tiles: vec![tile("a"), tile("b")], model: None };
        let body = json!({"results": [{"markdown": "hello"}, {"markdown": "world"}]});
        let out = normalize_response(&body, &batch).unwrap();
        assert_eq!(out, vec![("a".to_string(), "hello".to_string()), ("b".to_string(), "world".to_string())]);
    }

    #[test]
    fn normalizes_chat_choices_string_content() {
        let batch = TileBatch { tiles: vec![tile("a")], model: None };
        let body = json!({"choices": [{"message": {"content": "hello world"}}]});
        let out = normalize_response(&body, &batch).unwrap();
        assert_eq!(out, vec![("a".to_string(), "hello world".to_string())]);
    }

    #[test]
    fn normalizes_chat_choices_content_parts() {
        let batch = TileBatch { tiles: vec![tile("a")], model: None };
        let body = json!({"choices": [{"message": {"content": [{"type": "text", "text": "line1"}, {"type": "text", "text": "line2"}]}}]});
        let out = normalize_response(&body, &batch).unwrap();
        assert_eq!(out, vec![("a".to_string(), "line1\nline2".to_string())]);
    }

    #[test]
    fn missing_content_raises() {
        let batch = TileBatch { tiles: vec![tile("a")], model: None };
        let body = json!({"choices": [{"message": {}}]});
        assert!(normalize_response(&body, &batch).is_err());
    }

    #[test]
    fn openai_payload_has_expected_shape() {
        let batch = TileBatch { tiles: vec![tile("a")], model: None };
        let payload = build_payload(BackendMode::OpenaiCompatible, DispatchShape::Chat, "glm-ocr", false, &batch).unwrap();
        assert_eq!(payload["model"], "glm-ocr");
        assert_eq!(payload["max_tokens"], 4096);
        assert!(payload["messages"][0]["content"][1]["image_url"]["url"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn maas_payload_has_file_field() {
        let batch = TileBatch { tiles: vec![tile("a")], model: None };
        let payload = build_payload(BackendMode::Maas, DispatchShape::Chat, "glm-ocr", false, &batch).unwrap();
        assert!(payload["file"].as_str().unwrap().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn legacy_batch_payload_carries_every_tile() {
        let batch = TileBatch { tiles: vec![tile("a"), tile("b")], model: None };
        let payload = build_payload(BackendMode::OpenaiCompatible, DispatchShape::LegacyBatch, "glm-ocr", true, &batch).unwrap();
        assert_eq!(payload["input"].as_array().unwrap().len(), 2);
        assert_eq!(payload["input"][0]["id"], "a");
        assert_eq!(payload["options"]["fp8"], true);
    }

    #[test]
    fn dispatch_url_selects_legacy_batch_suffix_for_ocr_shape() {
        let url = dispatch_url("http://127.0.0.1:8001/v1", BackendMode::OpenaiCompatible, DispatchShape::LegacyBatch);
        assert_eq!(url, "http://127.0.0.1:8001/v1/ocr");
        let url = dispatch_url("http://127.0.0.1:8001/v1", BackendMode::OpenaiCompatible, DispatchShape::Chat);
        assert_eq!(url, "http://127.0.0.1:8001/v1/chat/completions");
    }
}
