// Model alias table.
//
// Maps a short, operator-facing model id to the resolved model
// identifier passed to the local inference server and the
// served-model-name advertised back to clients.

use std::collections::HashMap;

/// Resolved launch identity for a local model alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub resolved_model: String,
    pub served_model_name: String,
}

fn builtin_aliases() -> HashMap<&'static str, (&'static str, &'static str)> {
    HashMap::from([
        ("glm-ocr", ("zai-org/GLM-4.1V-9B-Thinking", "glm-ocr")),
        ("glm-ocr-fp8", ("zai-org/GLM-4.1V-9B-Thinking-FP8", "glm-ocr-fp8")),
    ])
}

/// Resolve `model_id` against the built-in table, falling back to
/// `overrides` (operator-supplied via `OcrSettings::model_aliases`),
/// and finally treating the id as already-resolved (self-alias) when
/// neither table knows it.
pub fn resolve(model_id: &str, overrides: &HashMap<String, (String, String)>) -> ResolvedModel {
    if let Some((resolved, served)) = overrides.get(model_id) {
        return ResolvedModel {
            resolved_model: resolved.clone(),
            served_model_name: served.clone(),
        };
    }
    if let Some((resolved, served)) = builtin_aliases().get(model_id) {
        return ResolvedModel {
            resolved_model: resolved.to_string(),
            served_model_name: served.to_string(),
        };
    }
    ResolvedModel {
        resolved_model: model_id.to_string(),
        served_model_name: model_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_builtin_alias() {
        let resolved = resolve("glm-ocr", &HashMap::new());
        assert_eq!(resolved.resolved_model, "zai-org/GLM-4.1V-9B-Thinking");
        assert_eq!(resolved.served_model_name, "glm-ocr");
    }

    #[test]
    fn operator_override_wins_over_builtin() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "glm-ocr".to_string(),
            ("custom/model".to_string(), "glm-ocr-custom".to_string()),
        );
        let resolved = resolve("glm-ocr", &overrides);
        assert_eq!(resolved.resolved_model, "custom/model");
    }

    #[test]
    fn unknown_model_id_is_treated_as_self_aliased() {
        let resolved = resolve("my-private-model", &HashMap::new());
        assert_eq!(resolved.resolved_model, "my-private-model");
        assert_eq!(resolved.served_model_name, "my-private-model");
    }
}
