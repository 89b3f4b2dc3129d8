use bytes::Bytes;
use channelrelay_core::relay::ErrorBody;
use std::fmt;
use std::io::Read;

use crate::gateway::error::RelayError;

/// Upstream body handed back on success. Streaming bodies stay unread until
/// the stream transformer drains them.
pub(crate) enum SuccessBody {
    Buffered(Bytes),
    Stream(Box<dyn Read + Send>),
}

impl fmt::Debug for SuccessBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuccessBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            SuccessBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct UpstreamSuccess {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: SuccessBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpstreamFailure {
    pub(crate) status: u16,
    pub(crate) message: String,
    pub(crate) error_type: String,
    pub(crate) code: String,
    /// Network, read or parse failure on our side; never retried.
    pub(crate) local: bool,
}

impl UpstreamFailure {
    pub(crate) fn from_upstream(status: u16, error: ErrorBody) -> Self {
        let message = if error.message.is_empty() {
            format!("upstream returned status {status}")
        } else {
            error.message
        };
        Self {
            status,
            message,
            error_type: if error.error_type.is_empty() {
                "upstream_error".to_string()
            } else {
                error.error_type
            },
            code: error.code,
            local: false,
        }
    }

    pub(crate) fn local(code: &str, message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
            error_type: "channel_relay_error".to_string(),
            code: code.to_string(),
            local: true,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Success(UpstreamSuccess),
    Failure(UpstreamFailure),
}

/// Why a 2xx upstream answer was not accepted as the final response.
#[derive(Debug)]
pub(crate) enum AcceptError {
    /// The body turned out to be a failure; classified like any other attempt failure.
    Failure(UpstreamFailure),
    /// Stops the relay immediately.
    Terminal(RelayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_failure_fills_missing_message_and_type() {
        let failure = UpstreamFailure::from_upstream(502, ErrorBody::default());
        assert_eq!(failure.message, "upstream returned status 502");
        assert_eq!(failure.error_type, "upstream_error");
        assert!(!failure.local);
    }

    #[test]
    fn local_failure_is_internal_and_flagged() {
        let failure = UpstreamFailure::local("do_request_failed", "connection refused");
        assert_eq!(failure.status, 500);
        assert!(failure.local);
        assert_eq!(failure.code, "do_request_failed");
    }
}
