// Configuration: typed settings with environment-variable overrides.
// One `OCR_AUTOPILOT_*` var per field; a var that fails to parse
// falls back to the struct default and logs a warning rather than
// failing configuration loading outright.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AutopilotError, AutopilotResult};

/// Runtime-tunable autopilot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrSettings {
    pub server_url: Option<String>,
    pub local_url: Option<String>,
    pub api_key: Option<String>,
    /// MaaS (Model-as-a-Service) backend base URL. Optional: a MaaS
    /// candidate is only resolved into the backend pool when this is
    /// set (`policy::resolve_candidates`, [ADDED]).
    pub maas_url: Option<String>,
    pub maas_api_key: Option<String>,
    pub model: String,
    pub use_fp8: bool,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub max_batch_tiles: usize,
    pub max_batch_bytes: usize,
    pub daily_quota_tiles: Option<u64>,
    pub local_autostart: bool,
    pub local_startup_timeout_s: u64,
    pub local_healthcheck_timeout_s: u64,
    pub local_max_restarts: u32,
    /// Operator-supplied additions to the built-in alias table
    /// (`alias.rs`), keyed by model id.
    #[serde(default)]
    pub model_aliases: HashMap<String, (String, String)>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            local_url: None,
            api_key: None,
            maas_url: None,
            maas_api_key: None,
            model: "glm-ocr".to_string(),
            use_fp8: false,
            min_concurrency: 1,
            max_concurrency: 8,
            max_batch_tiles: 8,
            max_batch_bytes: 8 * 1024 * 1024,
            daily_quota_tiles: None,
            local_autostart: true,
            local_startup_timeout_s: 120,
            local_healthcheck_timeout_s: 5,
            local_max_restarts: 2,
            model_aliases: HashMap::new(),
        }
    }
}

impl OcrSettings {
    /// Load settings from a TOML file, then apply environment overrides.
    pub fn from_file(path: &str) -> AutopilotResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AutopilotError::Config(format!("failed to read config file {path}: {e}")))?;
        let settings: OcrSettings = toml::from_str(&content)
            .map_err(|e| AutopilotError::Config(format!("failed to parse config file: {e}")))?;
        Ok(settings.with_env_overrides())
    }

    /// Apply `OCR_AUTOPILOT_*` environment overrides on top of `self`,
    /// ignoring (and warning on) variables that fail to parse.
    pub fn with_env_overrides(mut self) -> Self {
        self.server_url = env_opt_string("OCR_AUTOPILOT_SERVER_URL").or(self.server_url);
        self.local_url = env_opt_string("OCR_AUTOPILOT_LOCAL_URL").or(self.local_url);
        self.api_key = env_opt_string("OCR_AUTOPILOT_API_KEY").or(self.api_key);
        self.maas_url = env_opt_string("OCR_AUTOPILOT_MAAS_URL").or(self.maas_url);
        self.maas_api_key = env_opt_string("OCR_AUTOPILOT_MAAS_API_KEY").or(self.maas_api_key);
        if let Some(v) = env_opt_string("OCR_AUTOPILOT_MODEL") {
            self.model = v;
        }
        apply_parsed("OCR_AUTOPILOT_USE_FP8", &mut self.use_fp8);
        apply_parsed("OCR_AUTOPILOT_MIN_CONCURRENCY", &mut self.min_concurrency);
        apply_parsed("OCR_AUTOPILOT_MAX_CONCURRENCY", &mut self.max_concurrency);
        apply_parsed("OCR_AUTOPILOT_MAX_BATCH_TILES", &mut self.max_batch_tiles);
        apply_parsed("OCR_AUTOPILOT_MAX_BATCH_BYTES", &mut self.max_batch_bytes);
        if let Some(v) = env_opt_string("OCR_AUTOPILOT_DAILY_QUOTA_TILES") {
            match v.parse::<u64>() {
                Ok(parsed) => self.daily_quota_tiles = Some(parsed),
                Err(_) => tracing::warn!(value = %v, "ignoring unparseable OCR_AUTOPILOT_DAILY_QUOTA_TILES"),
            }
        }
        apply_parsed("OCR_AUTOPILOT_LOCAL_AUTOSTART", &mut self.local_autostart);
        apply_parsed(
            "OCR_AUTOPILOT_LOCAL_STARTUP_TIMEOUT_S",
            &mut self.local_startup_timeout_s,
        );
        apply_parsed(
            "OCR_AUTOPILOT_LOCAL_HEALTHCHECK_TIMEOUT_S",
            &mut self.local_healthcheck_timeout_s,
        );
        apply_parsed("OCR_AUTOPILOT_LOCAL_MAX_RESTARTS", &mut self.local_max_restarts);
        self
    }

    pub fn validate(&self) -> AutopilotResult<()> {
        if self.model.is_empty() {
            return Err(AutopilotError::Config("model must not be empty".to_string()));
        }
        if self.server_url.is_none() && self.local_url.is_none() {
            return Err(AutopilotError::Config(
                "at least one of server_url or local_url must be set".to_string(),
            ));
        }
        if self.min_concurrency == 0 || self.min_concurrency > self.max_concurrency {
            return Err(AutopilotError::Config(
                "min_concurrency must be >= 1 and <= max_concurrency".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn apply_parsed<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Some(raw) = env_opt_string(key) {
        match raw.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var = key, value = %raw, "ignoring unparseable override, keeping default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid_when_local_url_set() {
        let mut settings = OcrSettings::default();
        settings.local_url = Some("http://localhost:8000".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_backend_urls() {
        let settings = OcrSettings::default();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_concurrency_bounds() {
        let mut settings = OcrSettings::default();
        settings.local_url = Some("http://localhost:8000".to_string());
        settings.min_concurrency = 10;
        settings.max_concurrency = 2;
        assert!(settings.validate().is_err());
    }
}
