use channelrelay_core::storage::Channel;
use reqwest::header::AUTHORIZATION;

use super::{header_value, UpstreamTarget};
use crate::gateway::capability::RelayMode;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

pub(crate) fn target(channel: &Channel, mode: RelayMode) -> Result<UpstreamTarget, String> {
    let base = channel.base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() {
        DEFAULT_OPENAI_BASE_URL
    } else {
        base
    };
    // 中文注释：base_url 已带 /v1 时不重复拼接。
    let path = if base.ends_with("/v1") {
        mode.path().trim_start_matches("/v1")
    } else {
        mode.path()
    };
    let mut headers = Vec::new();
    let key = channel.key.trim();
    if !key.is_empty() {
        headers.push((AUTHORIZATION, header_value("authorization", &format!("Bearer {key}"))?));
    }
    Ok(UpstreamTarget {
        url: format!("{base}{path}"),
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_base_url_and_mode_path() {
        let channel = Channel {
            base_url: "https://relay.example.com/".to_string(),
            key: "sk-test".to_string(),
            ..Channel::default()
        };
        let target = target(&channel, RelayMode::ChatCompletions).expect("target");
        assert_eq!(target.url, "https://relay.example.com/v1/chat/completions");
        assert_eq!(target.headers[0].1.to_str().ok(), Some("Bearer sk-test"));
    }

    #[test]
    fn empty_base_url_defaults_and_v1_suffix_is_not_doubled() {
        let channel = Channel::default();
        assert_eq!(
            target(&channel, RelayMode::Embeddings).expect("target").url,
            "https://api.openai.com/v1/embeddings"
        );
        let channel = Channel {
            base_url: "http://127.0.0.1:9000/v1".to_string(),
            ..Channel::default()
        };
        let target = target(&channel, RelayMode::Moderations).expect("target");
        assert_eq!(target.url, "http://127.0.0.1:9000/v1/moderations");
        assert!(target.headers.is_empty());
    }
}
