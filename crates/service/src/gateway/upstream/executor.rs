use bytes::Bytes;
use channelrelay_core::relay::{ErrorBody, ErrorEnvelope};
use channelrelay_core::storage::Channel;
use serde_json::Value;
use std::collections::HashMap;

use super::deadline::RequestDeadline;
use super::outcome::Outcome;
use crate::gateway::capability::{Fingerprint, RelayMode};
use crate::gateway::rewindable_body::RewindableBody;

const ERROR_BODY_PREVIEW_CHARS: usize = 256;

/// Everything an executor needs for one attempt besides the channel itself.
pub(crate) struct ExecuteRequest<'a> {
    pub(crate) mode: RelayMode,
    pub(crate) fingerprint: &'a Fingerprint,
    pub(crate) body: &'a RewindableBody,
    pub(crate) deadline: RequestDeadline,
    pub(crate) request_id: &'a str,
}

/// Performs one upstream call. Implementations never panic on upstream
/// misbehaviour; every problem comes back as `Outcome::Failure`.
pub(crate) trait RelayExecutor: Send + Sync {
    fn execute(&self, channel: &Channel, request: &ExecuteRequest<'_>) -> Outcome;
}

fn parse_json_map(raw: Option<&str>) -> HashMap<String, String> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty() && *raw != "{}") else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, Value>>(raw) {
        Ok(map) => map
            .into_iter()
            .filter_map(|(from, to)| match to {
                Value::String(to) => Some((from, to)),
                Value::Number(to) => Some((from, to.to_string())),
                _ => None,
            })
            .collect(),
        Err(err) => {
            log::warn!("event=channel_mapping_invalid err={}", err);
            HashMap::new()
        }
    }
}

/// Applies the channel's `model_mapping` to the requested model.
pub(crate) fn mapped_model(channel: &Channel, model: &str) -> String {
    parse_json_map(channel.model_mapping.as_deref())
        .get(model)
        .map(|mapped| mapped.trim())
        .filter(|mapped| !mapped.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| model.to_string())
}

/// Applies the channel's `status_code_mapping` to an upstream failure status.
pub(crate) fn mapped_status(channel: &Channel, status: u16) -> u16 {
    parse_json_map(channel.status_code_mapping.as_deref())
        .get(&status.to_string())
        .and_then(|mapped| mapped.trim().parse::<u16>().ok())
        .filter(|mapped| (100..=599).contains(mapped))
        .unwrap_or(status)
}

/// Request body for the upstream. Bytes are reused verbatim unless the model was remapped.
pub(crate) fn body_for_upstream(
    body: &RewindableBody,
    requested_model: &str,
    upstream_model: &str,
) -> Result<Bytes, String> {
    if requested_model == upstream_model || body.is_empty() {
        return Ok(body.bytes().clone());
    }
    let mut value = serde_json::from_reader::<_, Value>(body.view())
        .map_err(|err| format!("request body is not valid json: {err}"))?;
    let Some(object) = value.as_object_mut() else {
        return Ok(body.bytes().clone());
    };
    object.insert("model".to_string(), Value::String(upstream_model.to_string()));
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|err| format!("serialize request body failed: {err}"))
}

/// Extracts the upstream error body; non-JSON bodies become the message text.
pub(crate) fn parse_error_body(raw: &[u8]) -> ErrorBody {
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(raw) {
        if !envelope.error.message.is_empty() || !envelope.error.error_type.is_empty() {
            return envelope.error;
        }
    }
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    ErrorBody {
        message: text.chars().take(ERROR_BODY_PREVIEW_CHARS).collect(),
        ..ErrorBody::default()
    }
}
