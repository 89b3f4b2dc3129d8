use rand::Rng;
use serde_json::{Map, Value};

use super::completion_id::generate_completion_id;

pub(crate) const SYSTEM_FINGERPRINT: &str = "fp_811936bd4f";

const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gpt-3.5-turbo", "gpt-3.5-turbo-0125"),
    ("gpt-3.5-turbo-16k", "gpt-3.5-turbo-16k-0613"),
    ("gpt-4", "gpt-4-0613"),
    ("gpt-4-32k", "gpt-4-32k-0613"),
    ("gpt-4-turbo-preview", "gpt-4-0125-preview"),
    ("gpt-4-turbo", "gpt-4-turbo-2024-04-09"),
    ("gpt-4o", "gpt-4o-2024-05-13"),
];

/// Model name reported back to the client. Configured overrides win over the
/// built-in table; unknown models pass through unchanged.
pub(crate) fn response_model_alias(model: &str) -> String {
    if let Some(alias) = super::runtime_config::model_alias_override(model) {
        return alias;
    }
    MODEL_ALIASES
        .iter()
        .find(|(from, _)| *from == model)
        .map(|(_, to)| (*to).to_string())
        .unwrap_or_else(|| model.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModelField {
    /// Stream frames only carry `model` on some providers; leave it absent if so.
    ReplaceIfPresent,
    Always,
}

fn created_or(frame: &Map<String, Value>, now: i64) -> i64 {
    frame
        .get("created")
        .and_then(|value| value.as_i64().or_else(|| value.as_f64().map(|v| v as i64)))
        .unwrap_or(now)
}

/// Applies the client-facing field rewrites to one response object in place.
pub(crate) fn rewrite_response_object<R: Rng + ?Sized>(
    frame: &mut Map<String, Value>,
    model_alias: &str,
    model_field: ModelField,
    now: i64,
    rng: &mut R,
) {
    if model_field == ModelField::Always || frame.contains_key("model") {
        frame.insert("model".to_string(), Value::String(model_alias.to_string()));
    }
    if frame.contains_key("system_fingerprint") {
        frame.insert(
            "system_fingerprint".to_string(),
            Value::String(SYSTEM_FINGERPRINT.to_string()),
        );
    }
    let created = created_or(frame, now);
    frame.insert(
        "id".to_string(),
        Value::String(generate_completion_id(created, rng)),
    );
    if let Some(Value::Array(choices)) = frame.get_mut("choices") {
        for choice in choices.iter_mut() {
            if let Value::Object(choice) = choice {
                choice.remove("content_filter_results");
            }
        }
    }
    frame.remove("prompt_filter_results");
}
