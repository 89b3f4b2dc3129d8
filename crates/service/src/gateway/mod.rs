#[path = "core/error.rs"]
mod error;
#[path = "core/runtime_config.rs"]
mod runtime_config;
#[path = "request/capability.rs"]
mod capability;
#[path = "request/incoming_headers.rs"]
mod incoming_headers;
#[path = "request/rewindable_body.rs"]
mod rewindable_body;
#[path = "request/request_entry.rs"]
mod request_entry;
#[path = "routing/directory.rs"]
mod directory;
#[path = "routing/directory_sync.rs"]
mod directory_sync;
#[path = "routing/selection.rs"]
mod selection;
#[path = "routing/retry_policy.rs"]
mod retry_policy;
#[path = "response/completion_id.rs"]
mod completion_id;
#[path = "response/rewrite.rs"]
mod rewrite;
#[path = "response/stream_relay.rs"]
mod stream_relay;
#[path = "response/buffered_relay.rs"]
mod buffered_relay;
mod token_estimator;
mod trace_log;
mod upstream;
#[cfg(test)]
mod test_env;

pub(crate) use directory::reload_shared_directory;
pub(crate) use directory_sync::ensure_directory_sync;
pub(crate) use request_entry::{handle_gateway_request, handle_models_request, respond_json};
pub(crate) use trace_log::{enable_trace_file, flush as flush_trace_log};

pub(crate) fn reload_runtime_config_from_env() {
    runtime_config::reload_from_env();
}

/// Whether `path` is one of the relayed OpenAI-compatible endpoints.
pub(crate) fn is_relay_path(path: &str) -> bool {
    capability::RelayMode::from_path(path).is_some()
}
