use channelrelay_core::relay::{ErrorBody, ErrorEnvelope};
use thiserror::Error;

use super::upstream::outcome::UpstreamFailure;

pub(crate) const SATURATED_MESSAGE: &str = "当前分组上游负载已饱和，请稍后再试";

/// Failure taxonomy of one relayed request. Every variant maps to an HTTP
/// status and to the client-facing `{"error": {...}}` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum RelayError {
    #[error("{message}")]
    InvalidRequest { message: String },
    #[error("{message}")]
    PinnedChannel { status: u16, message: String },
    #[error("no available channel for group {group} model {model}")]
    NoCandidate { group: String, model: String },
    #[error("database consistency broken: ability references missing channel #{channel_id}")]
    DirectoryInconsistent { channel_id: i64 },
    #[error("{}", .0.message)]
    Upstream(UpstreamFailure),
    #[error("{message}")]
    Transform { code: String, message: String },
    #[error("{message}")]
    Local { status: u16, code: String, message: String },
}

impl RelayError {
    pub(crate) fn status_code(&self) -> u16 {
        match self {
            RelayError::InvalidRequest { .. } => 400,
            RelayError::PinnedChannel { status, .. } => *status,
            RelayError::NoCandidate { .. } | RelayError::DirectoryInconsistent { .. } => 503,
            RelayError::Upstream(failure) => failure.status,
            RelayError::Transform { .. } => 500,
            RelayError::Local { status, .. } => *status,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            RelayError::InvalidRequest { .. } | RelayError::PinnedChannel { .. } => {
                "invalid_request_error"
            }
            RelayError::Upstream(failure) => failure.error_type.as_str(),
            _ => "channel_relay_error",
        }
    }

    fn code(&self) -> &str {
        match self {
            RelayError::InvalidRequest { .. } => "invalid_request",
            RelayError::PinnedChannel { .. } => "invalid_channel",
            RelayError::NoCandidate { .. } => "no_available_channel",
            RelayError::DirectoryInconsistent { .. } => "directory_inconsistent",
            RelayError::Upstream(failure) => failure.code.as_str(),
            RelayError::Transform { code, .. } | RelayError::Local { code, .. } => code.as_str(),
        }
    }

    /// 429 is reworded as a saturation notice; every message carries the request id.
    pub(crate) fn client_message(&self, request_id: &str) -> String {
        let message = if self.status_code() == 429 {
            SATURATED_MESSAGE.to_string()
        } else {
            self.to_string()
        };
        message_with_request_id(&message, request_id)
    }

    pub(crate) fn to_envelope(&self, request_id: &str) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.client_message(request_id),
                error_type: self.error_type().to_string(),
                param: String::new(),
                code: self.code().to_string(),
            },
        }
    }
}

pub(crate) fn message_with_request_id(message: &str, request_id: &str) -> String {
    if request_id.is_empty() {
        return message.to_string();
    }
    format!("{message} (request id: {request_id})")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(status: u16, message: &str) -> RelayError {
        RelayError::Upstream(UpstreamFailure {
            status,
            message: message.to_string(),
            error_type: "upstream_error".to_string(),
            code: "rate_limit_exceeded".to_string(),
            local: false,
        })
    }

    #[test]
    fn rate_limited_upstream_is_reworded_and_keeps_status() {
        let err = upstream(429, "Rate limit reached for requests");
        let envelope = err.to_envelope("req-1");
        assert_eq!(err.status_code(), 429);
        assert_eq!(
            envelope.error.message,
            format!("{SATURATED_MESSAGE} (request id: req-1)")
        );
        assert_eq!(envelope.error.code, "rate_limit_exceeded");
    }

    #[test]
    fn other_upstream_messages_pass_through_with_request_id() {
        let err = upstream(400, "bad prompt");
        assert_eq!(err.client_message("abc"), "bad prompt (request id: abc)");
    }

    #[test]
    fn selection_and_directory_errors_are_distinct_503s() {
        let no_candidate = RelayError::NoCandidate {
            group: "default".to_string(),
            model: "m".to_string(),
        };
        let inconsistent = RelayError::DirectoryInconsistent { channel_id: 7 };
        assert_eq!(no_candidate.status_code(), 503);
        assert_eq!(inconsistent.status_code(), 503);
        assert_eq!(
            no_candidate.to_envelope("").error.message,
            "no available channel for group default model m"
        );
        assert_eq!(inconsistent.to_envelope("").error.code, "directory_inconsistent");
    }

    #[test]
    fn transform_failure_is_internal() {
        let err = RelayError::Transform {
            code: "unmarshal_response_body_failed".to_string(),
            message: "expected value at line 1".to_string(),
        };
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.to_envelope("r").error.error_type, "channel_relay_error");
    }
}
