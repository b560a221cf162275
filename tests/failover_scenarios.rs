// Integration coverage for the failover + circuit-breaker scenario
// (end-to-end scenario 6): a persistently unhealthy local backend
// opens its circuit after two consecutive failures while a healthy
// remote backend keeps submissions succeeding.

use ocr_autopilot::events::EventKind;
use ocr_autopilot::pipeline::{submit_tiles, PipelineState};
use ocr_autopilot::{AutopilotError, OcrSettings};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn tile(id: &str) -> ocr_autopilot::batch::TileRequest {
    ocr_autopilot::batch::TileRequest {
        tile_id: id.to_string(),
        image_bytes: vec![0xFFu8; 16],
        model_override: None,
    }
}

#[tokio::test]
async fn local_unhealthy_then_circuit_opens_while_remote_keeps_succeeding() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "remote ocr text"}}]
        })))
        .mount(&remote)
        .await;

    let settings = OcrSettings {
        // Port 1 is reserved and never accepts connections, so the
        // probe fails deterministically without needing a real server.
        local_url: Some("http://127.0.0.1:1".to_string()),
        local_autostart: false,
        server_url: Some(format!("{}/v1", remote.uri())),
        ..OcrSettings::default()
    };
    let capabilities = ocr_autopilot::hardware::capabilities();
    let state = PipelineState::new(None);

    for submission in 1..=3 {
        let result = submit_tiles(vec![tile("a")], &settings, &capabilities, &state, None)
            .await
            .unwrap_or_else(|e| panic!("submission {submission} failed entirely: {e}"));

        assert_eq!(result.markdown_chunks, vec!["remote ocr text".to_string()]);

        let events = &result.failover_events;
        assert!(events
            .iter()
            .any(|e| e.backend_id == "glm-ocr-remote-openai" && e.event == EventKind::BackendSucceeded));

        if submission < 3 {
            assert!(events.iter().any(|e| e.backend_id == "glm-ocr-local-openai"
                && e.reason_code.as_deref() == Some("runtime.failover.local-unhealthy")));
        } else {
            assert!(events.iter().any(|e| e.backend_id == "glm-ocr-local-openai"
                && e.reason_code.as_deref() == Some("runtime.failover.circuit-open")));
        }
    }
}

#[tokio::test]
async fn empty_submission_short_circuits_without_touching_backends() {
    let settings = OcrSettings {
        server_url: Some("http://127.0.0.1:1".to_string()),
        ..OcrSettings::default()
    };
    let capabilities = ocr_autopilot::hardware::capabilities();
    let state = PipelineState::new(None);

    let result = submit_tiles(vec![], &settings, &capabilities, &state, None).await.unwrap();
    assert!(result.markdown_chunks.is_empty());
    assert_eq!(result.batches, 0);
}

#[tokio::test]
async fn legacy_ocr_batch_endpoint_is_dispatched_through_the_ocr_suffix() {
    let remote = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/ocr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{"markdown": "legacy batch text"}]
        })))
        .mount(&remote)
        .await;

    let settings = OcrSettings {
        server_url: Some(format!("{}/v1/ocr", remote.uri())),
        ..OcrSettings::default()
    };
    let capabilities = ocr_autopilot::hardware::capabilities();
    let state = PipelineState::new(None);

    let result = submit_tiles(vec![tile("a")], &settings, &capabilities, &state, None)
        .await
        .expect("submission against the legacy endpoint should succeed");

    assert_eq!(result.markdown_chunks, vec!["legacy batch text".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn all_backends_failing_surfaces_a_terminal_error() {
    let settings = OcrSettings {
        local_url: Some("http://127.0.0.1:1".to_string()),
        local_autostart: false,
        server_url: Some("http://127.0.0.1:2".to_string()),
        ..OcrSettings::default()
    };
    let capabilities = ocr_autopilot::hardware::capabilities();
    let state = PipelineState::new(None);

    let result = submit_tiles(vec![tile("a")], &settings, &capabilities, &state, None).await;
    assert!(matches!(result, Err(AutopilotError::AllBackendsFailed(_))));
}
