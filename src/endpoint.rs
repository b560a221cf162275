// Endpoint normalization and probing.

use std::time::Duration;

use url::Url;

use crate::error::{AutopilotError, AutopilotResult};

/// Outcome of probing a normalized endpoint.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub status: Option<u16>,
    pub url: Option<String>,
}

/// Which wire shape a configured endpoint dispatches through, derived
/// from the URL's original suffix. A base ending in `/ocr` selects the
/// legacy batch shape (`input`/`options.fp8`); any other base
/// dispatches through the openai-compatible chat shape.
/// Preserved as a distinct field rather than folded into `BackendMode`
/// so the two dispatch paths stay independently selectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchShape {
    Chat,
    LegacyBatch,
}

/// A canonicalized OCR endpoint base, plus the derived probe targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEndpoint {
    pub scheme: String,
    pub netloc: String,
    pub base: String,
    pub dispatch: DispatchShape,
    probe_candidates: Vec<String>,
}

impl NormalizedEndpoint {
    pub fn probe_candidates(&self) -> &[String] {
        &self.probe_candidates
    }
}

/// Parse and canonicalize a user-supplied OCR URL.
///
/// Rejects schemes outside `{http, https}` and empty netlocs. Strips a
/// trailing `/chat/completions` or `/models` suffix and defaults an
/// empty path to `/v1`. A trailing `/ocr` suffix is also stripped and
/// marks the endpoint for legacy batch dispatch rather than chat
/// dispatch (see [`DispatchShape`]). Produces `{base}/models` and
/// `{scheme}://{netloc}/health` as probe candidates, deduplicated
/// while preserving order.
pub fn normalize(raw: &str) -> AutopilotResult<NormalizedEndpoint> {
    let parsed = Url::parse(raw)?;

    let scheme = parsed.scheme().to_string();
    if scheme != "http" && scheme != "https" {
        return Err(AutopilotError::Config(format!(
            "unsupported scheme: {scheme}"
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AutopilotError::Config("empty netloc".to_string()))?;
    if host.is_empty() {
        return Err(AutopilotError::Config("empty netloc".to_string()));
    }
    let netloc = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut path = parsed.path().trim_end_matches('/').to_string();
    let mut dispatch = DispatchShape::Chat;
    for suffix in ["/chat/completions", "/models"] {
        if let Some(stripped) = path.strip_suffix(suffix) {
            path = stripped.to_string();
            break;
        }
    }
    if let Some(stripped) = path.strip_suffix("/ocr") {
        path = stripped.to_string();
        dispatch = DispatchShape::LegacyBatch;
    }
    if path.is_empty() {
        path = "/v1".to_string();
    }

    let base = format!("{scheme}://{netloc}{path}");

    let mut probe_candidates = Vec::new();
    let models_candidate = format!("{base}/models");
    let health_candidate = format!("{scheme}://{netloc}/health");
    probe_candidates.push(models_candidate);
    if !probe_candidates.contains(&health_candidate) {
        probe_candidates.push(health_candidate);
    }

    Ok(NormalizedEndpoint {
        scheme,
        netloc,
        base,
        dispatch,
        probe_candidates,
    })
}

/// Probe every candidate in order; the first response with status < 500
/// within `timeout` wins. Connection failures on one candidate do not
/// abort the sweep — they just fall through to the next candidate.
pub async fn probe(
    client: &reqwest::Client,
    endpoint: &NormalizedEndpoint,
    timeout: Duration,
) -> ProbeResult {
    for candidate in endpoint.probe_candidates() {
        let attempt = client.get(candidate).timeout(timeout).send().await;
        match attempt {
            Ok(response) => {
                let status = response.status().as_u16();
                if status < 500 {
                    return ProbeResult {
                        healthy: true,
                        status: Some(status),
                        url: Some(candidate.clone()),
                    };
                }
            }
            Err(_) => continue,
        }
    }
    ProbeResult {
        healthy: false,
        status: None,
        url: None,
    }
}
