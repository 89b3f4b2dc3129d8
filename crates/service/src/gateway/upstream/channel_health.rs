use channelrelay_core::storage::{Channel, CHANNEL_STATUS_AUTO_DISABLED};
use std::sync::Arc;
use std::thread;

use super::outcome::UpstreamFailure;
use crate::gateway::directory::SnapshotDirectory;

const DISABLING_ERROR_TYPES: [&str; 4] = [
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];
const DISABLING_ERROR_CODES: [&str; 3] = [
    "invalid_api_key",
    "account_deactivated",
    "billing_not_active",
];

/// Failures that mean the channel's credential is unusable, not that the call was unlucky.
pub(crate) fn should_disable_channel(failure: &UpstreamFailure) -> bool {
    if failure.local {
        return false;
    }
    failure.status == 401
        || DISABLING_ERROR_TYPES.contains(&failure.error_type.as_str())
        || DISABLING_ERROR_CODES.contains(&failure.code.as_str())
}

/// Receives every failed attempt.
pub(crate) trait ChannelErrorSink: Send + Sync {
    fn channel_failed(&self, channel: &Channel, failure: &UpstreamFailure);
}

fn log_channel_error(channel: &Channel, failure: &UpstreamFailure) {
    log::warn!(
        "relay error (channel #{}, status code: {}): {}",
        channel.id,
        failure.status,
        failure.message
    );
}

type DisableFn = fn(&Channel, &str, &SnapshotDirectory) -> Result<(), String>;

fn disable_in_storage(
    channel: &Channel,
    reason: &str,
    directory: &SnapshotDirectory,
) -> Result<(), String> {
    let storage = crate::storage_helpers::open_storage()?;
    storage
        .update_channel_status(channel.id, CHANNEL_STATUS_AUTO_DISABLED)
        .map_err(|err| format!("disable channel failed: {err}"))?;
    log::warn!(
        "event=channel_auto_disabled channel_id={} name={} reason={}",
        channel.id,
        channel.name,
        reason
    );
    directory.reload(&storage)
}

/// Logs failures and auto-disables channels with `auto_ban` set when the failure
/// indicates a dead credential. The status write and directory reload run on a
/// detached thread so the next attempt is not held up.
pub(crate) struct AutoDisableSink {
    directory: Arc<SnapshotDirectory>,
    disable: DisableFn,
}

impl AutoDisableSink {
    pub(crate) fn new(directory: Arc<SnapshotDirectory>) -> Self {
        Self {
            directory,
            disable: disable_in_storage,
        }
    }

    fn spawn_disable(&self, channel: &Channel, reason: &str) {
        let channel = channel.clone();
        let reason = reason.to_string();
        let directory = Arc::clone(&self.directory);
        let disable = self.disable;
        let spawned = thread::Builder::new()
            .name("relay-channel-disable".to_string())
            .spawn(move || {
                if let Err(err) = disable(&channel, &reason, &directory) {
                    log::error!(
                        "event=channel_auto_disable_failed channel_id={} err={}",
                        channel.id,
                        err
                    );
                }
            });
        if let Err(err) = spawned {
            log::error!("event=channel_auto_disable_spawn_failed err={}", err);
        }
    }
}

impl ChannelErrorSink for AutoDisableSink {
    fn channel_failed(&self, channel: &Channel, failure: &UpstreamFailure) {
        log_channel_error(channel, failure);
        if !channel.auto_ban || !should_disable_channel(failure) {
            return;
        }
        self.spawn_disable(channel, &failure.message);
    }
}
