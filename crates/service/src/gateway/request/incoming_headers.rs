use tiny_http::Request;

pub(crate) const HEADER_CHANNEL_GROUP: &str = "X-Channel-Group";
pub(crate) const HEADER_CHANNEL_ID: &str = "X-Channel-Id";
pub(crate) const HEADER_REQUEST_ID: &str = "X-Request-Id";

/// Routing-relevant inbound headers, read once per request.
#[derive(Debug, Clone, Default)]
pub(crate) struct IncomingHeaderSnapshot {
    group: Option<String>,
    pinned_channel: Option<String>,
    request_id: Option<String>,
    content_type: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl IncomingHeaderSnapshot {
    pub(crate) fn from_request(request: &Request) -> Self {
        Self::from_pairs(
            request
                .headers()
                .iter()
                .map(|header| (header.field.as_str().as_str(), header.value.as_str())),
        )
    }

    pub(crate) fn from_pairs<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut snapshot = IncomingHeaderSnapshot::default();
        for (name, value) in headers {
            let slot = if name.eq_ignore_ascii_case(HEADER_CHANNEL_GROUP) {
                &mut snapshot.group
            } else if name.eq_ignore_ascii_case(HEADER_CHANNEL_ID) {
                &mut snapshot.pinned_channel
            } else if name.eq_ignore_ascii_case(HEADER_REQUEST_ID) {
                &mut snapshot.request_id
            } else if name.eq_ignore_ascii_case("Content-Type") {
                &mut snapshot.content_type
            } else {
                continue;
            };
            if slot.is_none() {
                *slot = non_empty(value);
            }
        }
        snapshot
    }

    pub(crate) fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Raw `X-Channel-Id` value; validated by the orchestrator.
    pub(crate) fn pinned_channel(&self) -> Option<&str> {
        self.pinned_channel.as_deref()
    }

    pub(crate) fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub(crate) fn is_multipart(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|value| value.to_ascii_lowercase().starts_with("multipart/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_headers_case_insensitively_and_keeps_first() {
        let snapshot = IncomingHeaderSnapshot::from_pairs([
            ("x-channel-group", " vip "),
            ("X-CHANNEL-GROUP", "other"),
            ("x-channel-id", "12"),
            ("x-request-id", ""),
            ("content-type", "multipart/form-data; boundary=x"),
        ]);
        assert_eq!(snapshot.group(), Some("vip"));
        assert_eq!(snapshot.pinned_channel(), Some("12"));
        assert_eq!(snapshot.request_id(), None);
        assert!(snapshot.is_multipart());
    }
}
