use channelrelay_core::storage::Channel;
use reqwest::header::HeaderName;

use super::{header_value, UpstreamTarget};
use crate::gateway::capability::RelayMode;

const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

/// Azure deployment names cannot contain dots, so `gpt-3.5-turbo` deploys as `gpt-35-turbo`.
pub(crate) fn deployment_name(model: &str) -> String {
    model.trim().replace('.', "")
}

fn task_path(mode: RelayMode) -> &'static str {
    mode.path().trim_start_matches("/v1/")
}

pub(crate) fn target(
    channel: &Channel,
    mode: RelayMode,
    upstream_model: &str,
) -> Result<UpstreamTarget, String> {
    let base = channel.base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err("azure endpoint missing: configure the channel base_url".to_string());
    }
    let api_version = match channel.other.trim() {
        "" => DEFAULT_AZURE_API_VERSION,
        version => version,
    };
    let url = format!(
        "{base}/openai/deployments/{}/{}?api-version={api_version}",
        deployment_name(upstream_model),
        task_path(mode),
    );
    Ok(UpstreamTarget {
        url,
        headers: vec![(
            HeaderName::from_static("api-key"),
            header_value("api-key", channel.key.trim())?,
        )],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use channelrelay_core::storage::CHANNEL_TYPE_AZURE;

    fn azure_channel(other: &str) -> Channel {
        Channel {
            channel_type: CHANNEL_TYPE_AZURE,
            base_url: "https://contoso.openai.azure.com/".to_string(),
            key: "azure-key".to_string(),
            other: other.to_string(),
            ..Channel::default()
        }
    }

    #[test]
    fn builds_deployment_url_with_api_version() {
        let target = target(&azure_channel("2024-05-01-preview"), RelayMode::ChatCompletions, "gpt-3.5-turbo")
            .expect("target");
        assert_eq!(
            target.url,
            "https://contoso.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions?api-version=2024-05-01-preview"
        );
        assert_eq!(target.headers[0].0.as_str(), "api-key");
        assert_eq!(target.headers[0].1.to_str().ok(), Some("azure-key"));
    }

    #[test]
    fn falls_back_to_default_api_version() {
        let target = target(&azure_channel(""), RelayMode::Embeddings, "text-embedding-3-small")
            .expect("target");
        assert!(target.url.ends_with("/embeddings?api-version=2024-02-01"));
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let channel = Channel {
            channel_type: CHANNEL_TYPE_AZURE,
            ..Channel::default()
        };
        assert!(target(&channel, RelayMode::ChatCompletions, "gpt-4").is_err());
    }
}
