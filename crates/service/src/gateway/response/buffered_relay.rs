use channelrelay_core::relay::{ErrorBody, SimpleResponse, Usage};
use channelrelay_core::storage::now_ts;
use rand::Rng;
use serde_json::Value;

use super::error::RelayError;
use super::rewrite::{response_model_alias, rewrite_response_object, ModelField};
use super::token_estimator::TokenCounter;
use super::upstream::outcome::{AcceptError, UpstreamFailure};

/// A rewritten non-streaming response, ready to be written to the client.
#[derive(Debug, Clone)]
pub(crate) struct BufferedRelay {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
    pub(crate) usage: Usage,
}

pub(crate) struct BufferedInput<'a> {
    pub(crate) status: u16,
    pub(crate) headers: &'a [(String, String)],
    pub(crate) body: &'a [u8],
    /// Model the client asked for; the response reports its alias.
    pub(crate) origin_model: &'a str,
    pub(crate) prompt_tokens: i64,
}

fn transform_error(code: &str, detail: impl std::fmt::Display) -> AcceptError {
    AcceptError::Terminal(RelayError::Transform {
        code: code.to_string(),
        message: format!("{}: {detail}", code.replace('_', " ")),
    })
}

fn classify_error_envelope(error: &Value) -> UpstreamFailure {
    let body = serde_json::from_value::<ErrorBody>(error.clone()).unwrap_or_default();
    let known_type = !body.error_type.trim().is_empty();
    let (status, code) = if known_type {
        (502, "openai_api_error")
    } else {
        (500, "unknown_error")
    };
    let message = if body.message.is_empty() {
        format!("upstream returned an error body ({code})")
    } else {
        body.message
    };
    UpstreamFailure {
        status,
        message,
        error_type: if known_type {
            body.error_type
        } else {
            "unknown_error".to_string()
        },
        code: code.to_string(),
        local: false,
    }
}

fn passthrough_header(name: &str) -> bool {
    !(name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection"))
}

fn usage_or_fallback(
    parsed: SimpleResponse,
    origin_model: &str,
    prompt_tokens: i64,
    counter: &dyn TokenCounter,
) -> Usage {
    match parsed.usage {
        Some(usage) if !usage.is_zero() => usage,
        _ => {
            let completion_tokens = parsed
                .choices
                .iter()
                .map(|choice| counter.count_text(&choice.content_text(), origin_model) as i64)
                .sum::<i64>();
            Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }
        }
    }
}

pub(crate) fn transform_buffered<R: Rng + ?Sized>(
    input: BufferedInput<'_>,
    counter: &dyn TokenCounter,
    rng: &mut R,
) -> Result<BufferedRelay, AcceptError> {
    let mut object = match serde_json::from_slice::<Value>(input.body) {
        Ok(Value::Object(object)) => object,
        Ok(other) => {
            return Err(transform_error(
                "unmarshal_response_body_failed",
                format!("expected a JSON object, got {}", json_kind(&other)),
            ))
        }
        Err(err) => return Err(transform_error("unmarshal_response_body_failed", err)),
    };

    if let Some(error) = object.get("error").filter(|error| !error.is_null()) {
        return Err(AcceptError::Failure(classify_error_envelope(error)));
    }

    let alias = response_model_alias(input.origin_model);
    rewrite_response_object(&mut object, &alias, ModelField::Always, now_ts(), rng);
    let body = serde_json::to_vec(&object)
        .map_err(|err| transform_error("marshal_modified_response_body_failed", err))?;

    let mut headers: Vec<(String, String)> = input
        .headers
        .iter()
        .filter(|(name, _)| passthrough_header(name))
        .cloned()
        .collect();
    headers.push(("Content-Length".to_string(), body.len().to_string()));

    // 中文注释：用量从改写前的原始响应解析，避免改写影响计费字段。
    let parsed = serde_json::from_slice::<SimpleResponse>(input.body)
        .map_err(|err| transform_error("unmarshal_response_body_failed", err))?;
    let usage = usage_or_fallback(parsed, input.origin_model, input.prompt_tokens, counter);

    Ok(BufferedRelay {
        status: input.status,
        headers,
        body,
        usage,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
