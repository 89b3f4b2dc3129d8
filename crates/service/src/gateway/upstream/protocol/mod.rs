use channelrelay_core::storage::{Channel, CHANNEL_TYPE_AZURE};
use reqwest::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};

use crate::gateway::capability::RelayMode;

pub(crate) mod azure_openai;
pub(crate) mod openai;

/// Resolved upstream endpoint and headers for one attempt.
#[derive(Debug, Clone)]
pub(crate) struct UpstreamTarget {
    pub(crate) url: String,
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, String> {
    HeaderValue::from_str(value).map_err(|_| format!("invalid {name} header value"))
}

pub(crate) fn build_target(
    channel: &Channel,
    mode: RelayMode,
    upstream_model: &str,
    is_stream: bool,
) -> Result<UpstreamTarget, String> {
    let mut target = if channel.channel_type == CHANNEL_TYPE_AZURE {
        azure_openai::target(channel, mode, upstream_model)?
    } else {
        openai::target(channel, mode)?
    };
    target
        .headers
        .push((CONTENT_TYPE, HeaderValue::from_static("application/json")));
    let accept = if is_stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    target.headers.push((ACCEPT, HeaderValue::from_static(accept)));
    Ok(target)
}
