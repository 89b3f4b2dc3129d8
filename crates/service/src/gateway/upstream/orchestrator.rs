use channelrelay_core::storage::Channel;
use rand::Rng;
use std::sync::Arc;

use super::channel_health::ChannelErrorSink;
use super::deadline::RequestDeadline;
use super::executor::{ExecuteRequest, RelayExecutor};
use super::outcome::{AcceptError, Outcome, UpstreamFailure, UpstreamSuccess};
use crate::gateway::capability::{Fingerprint, RelayMode};
use crate::gateway::directory::AbilityDirectory;
use crate::gateway::error::RelayError;
use crate::gateway::retry_policy::should_retry;
use crate::gateway::rewindable_body::RewindableBody;
use crate::gateway::selection::select_channel;
use crate::gateway::trace_log;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RelayPolicy {
    /// Total attempts, first one included.
    pub(crate) retry_budget: usize,
}

impl RelayPolicy {
    pub(crate) fn from_config() -> Self {
        Self {
            retry_budget: crate::gateway::runtime_config::retry_budget(),
        }
    }
}

pub(crate) struct RelayRequest<'a> {
    pub(crate) trace_id: &'a str,
    pub(crate) request_id: &'a str,
    pub(crate) mode: RelayMode,
    pub(crate) fingerprint: &'a Fingerprint,
    pub(crate) body: &'a RewindableBody,
    /// Raw `X-Channel-Id` header value, if the caller pinned a channel.
    pub(crate) pinned_channel: Option<&'a str>,
    pub(crate) deadline: RequestDeadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttemptRecord {
    pub(crate) channel_id: i64,
    pub(crate) priority: i64,
    /// `None` while the attempt is in flight or when it succeeded.
    pub(crate) failure_status: Option<u16>,
}

/// Ordered record of the channels tried for one client request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AttemptTrace {
    attempts: Vec<AttemptRecord>,
}

impl AttemptTrace {
    fn push(&mut self, channel_id: i64, priority: i64) {
        self.attempts.push(AttemptRecord {
            channel_id,
            priority,
            failure_status: None,
        });
    }

    fn mark_failed(&mut self, status: u16) {
        if let Some(last) = self.attempts.last_mut() {
            last.failure_status = Some(status);
        }
    }

    #[cfg(test)]
    pub(crate) fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    #[cfg(test)]
    pub(crate) fn channel_ids(&self) -> Vec<i64> {
        self.attempts.iter().map(|attempt| attempt.channel_id).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.attempts.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// `3->5->9`
    pub(crate) fn joined(&self) -> String {
        self.attempts
            .iter()
            .map(|attempt| attempt.channel_id.to_string())
            .collect::<Vec<_>>()
            .join("->")
    }

    /// `3(p10,429)->5(p0,ok)` for diagnostics.
    fn detailed(&self) -> String {
        self.attempts
            .iter()
            .map(|attempt| match attempt.failure_status {
                Some(status) => format!("{}(p{},{})", attempt.channel_id, attempt.priority, status),
                None => format!("{}(p{},ok)", attempt.channel_id, attempt.priority),
            })
            .collect::<Vec<_>>()
            .join("->")
    }
}

#[derive(Debug)]
pub(crate) struct Delivery<T> {
    pub(crate) channel: Arc<Channel>,
    pub(crate) payload: T,
    pub(crate) trace: AttemptTrace,
}

#[derive(Debug)]
pub(crate) struct RelayFailure {
    pub(crate) error: RelayError,
    pub(crate) trace: AttemptTrace,
}

struct AttemptLoop<'a, 'r> {
    executor: &'a dyn RelayExecutor,
    errors: &'a dyn ChannelErrorSink,
    request: &'a RelayRequest<'r>,
    trace: AttemptTrace,
}

enum AttemptResult<T> {
    Delivered(T),
    Failed(UpstreamFailure),
    Terminal(RelayError),
}

impl AttemptLoop<'_, '_> {
    fn attempt<T, F>(&mut self, channel: &Channel, priority: i64, accept: &mut F) -> AttemptResult<T>
    where
        F: FnMut(&Channel, UpstreamSuccess) -> Result<T, AcceptError>,
    {
        let index = self.trace.len();
        self.trace.push(channel.id, priority);
        trace_log::log_attempt(self.request.trace_id, index, channel.id, priority);
        let execute = ExecuteRequest {
            mode: self.request.mode,
            fingerprint: self.request.fingerprint,
            body: self.request.body,
            deadline: self.request.deadline,
            request_id: self.request.request_id,
        };
        let failure = match self.executor.execute(channel, &execute) {
            Outcome::Success(success) => {
                let status = success.status;
                match accept(channel, success) {
                    Ok(payload) => {
                        trace_log::log_attempt_result(self.request.trace_id, channel.id, status, false, None);
                        return AttemptResult::Delivered(payload);
                    }
                    Err(AcceptError::Terminal(err)) => {
                        self.trace.mark_failed(err.status_code());
                        trace_log::log_attempt_result(
                            self.request.trace_id,
                            channel.id,
                            err.status_code(),
                            false,
                            Some(&err.to_string()),
                        );
                        return AttemptResult::Terminal(err);
                    }
                    Err(AcceptError::Failure(failure)) => failure,
                }
            }
            Outcome::Failure(failure) => failure,
        };
        self.trace.mark_failed(failure.status);
        self.errors.channel_failed(channel, &failure);
        AttemptResult::Failed(failure)
    }

    fn log_result(&self, channel_id: i64, failure: &UpstreamFailure, retryable: bool) {
        trace_log::log_attempt_result(
            self.request.trace_id,
            channel_id,
            failure.status,
            retryable,
            Some(&failure.message),
        );
    }

    fn finish(self) -> AttemptTrace {
        if self.trace.len() > 1 {
            let chain = self.trace.joined();
            log::info!(
                "event=relay_retry_chain request_id={} chain={} detail={}",
                self.request.request_id,
                chain,
                self.trace.detailed()
            );
            trace_log::log_retry_chain(self.request.trace_id, &chain);
        }
        self.trace
    }
}

fn pinned_error(status: u16, message: String) -> RelayError {
    RelayError::PinnedChannel { status, message }
}

fn resolve_pinned(directory: &dyn AbilityDirectory, raw: &str) -> Result<Arc<Channel>, RelayError> {
    let channel_id = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| pinned_error(400, "invalid channel id".to_string()))?;
    let channel = directory
        .channel(channel_id)
        .ok_or_else(|| pinned_error(400, format!("channel #{channel_id} not found")))?;
    if !channel.is_enabled() {
        return Err(pinned_error(403, format!("channel #{channel_id} is disabled")));
    }
    Ok(channel)
}

/// Runs the relay for one client request: pick a channel per attempt, execute,
/// classify failures, and stop at the first accepted success or when the retry
/// budget, the deadline or the candidate tiers run out.
///
/// `accept` turns a 2xx outcome into the payload handed back to the caller.
/// It may reject the body as a classified failure (which can be retried) or as
/// a terminal error.
pub(crate) fn run_relay<T, R, F>(
    directory: &dyn AbilityDirectory,
    executor: &dyn RelayExecutor,
    errors: &dyn ChannelErrorSink,
    policy: RelayPolicy,
    request: &RelayRequest<'_>,
    rng: &mut R,
    mut accept: F,
) -> Result<Delivery<T>, RelayFailure>
where
    R: Rng + ?Sized,
    F: FnMut(&Channel, UpstreamSuccess) -> Result<T, AcceptError>,
{
    let mut attempts = AttemptLoop {
        executor,
        errors,
        request,
        trace: AttemptTrace::default(),
    };

    if let Some(raw) = request.pinned_channel {
        let channel = match resolve_pinned(directory, raw) {
            Ok(channel) => channel,
            Err(error) => {
                return Err(RelayFailure {
                    error,
                    trace: attempts.finish(),
                })
            }
        };
        // 中文注释：指定渠道只尝试一次，失败直接返回，不进入重试。
        let result = attempts.attempt(&channel, channel.priority, &mut accept);
        if let AttemptResult::Failed(failure) = &result {
            attempts.log_result(channel.id, failure, should_retry(failure.status, failure.local, true));
        }
        let trace = attempts.finish();
        return match result {
            AttemptResult::Delivered(payload) => Ok(Delivery {
                channel,
                payload,
                trace,
            }),
            AttemptResult::Failed(failure) => Err(RelayFailure {
                error: RelayError::Upstream(failure),
                trace,
            }),
            AttemptResult::Terminal(error) => Err(RelayFailure { error, trace }),
        };
    }

    let budget = policy.retry_budget.max(1);
    let mut last_failure: Option<UpstreamFailure> = None;
    for attempt in 0..budget {
        if attempt > 0 && request.deadline.is_expired() {
            log::warn!(
                "event=relay_deadline_exhausted request_id={} attempts={}",
                request.request_id,
                attempt
            );
            break;
        }
        let selected = match select_channel(directory, request.fingerprint, attempt, rng) {
            Ok(selected) => selected,
            Err(error @ RelayError::DirectoryInconsistent { .. }) => {
                log::error!("event=directory_inconsistent request_id={} err={}", request.request_id, error);
                return Err(RelayFailure {
                    error,
                    trace: attempts.finish(),
                });
            }
            Err(error) => {
                if last_failure.is_some() {
                    break;
                }
                return Err(RelayFailure {
                    error,
                    trace: attempts.finish(),
                });
            }
        };
        let channel = selected.channel;
        match attempts.attempt(&channel, selected.priority, &mut accept) {
            AttemptResult::Delivered(payload) => {
                return Ok(Delivery {
                    channel,
                    payload,
                    trace: attempts.finish(),
                })
            }
            AttemptResult::Terminal(error) => {
                return Err(RelayFailure {
                    error,
                    trace: attempts.finish(),
                })
            }
            AttemptResult::Failed(failure) => {
                let retryable = should_retry(failure.status, failure.local, false);
                attempts.log_result(channel.id, &failure, retryable);
                if attempt + 1 < budget && retryable {
                    log::info!(
                        "event=relay_retry request_id={} failed_channel={} status={} remaining={}",
                        request.request_id,
                        channel.id,
                        failure.status,
                        budget - attempt - 1
                    );
                }
                last_failure = Some(failure);
                if !retryable {
                    break;
                }
            }
        }
    }

    let trace = attempts.finish();
    let error = match last_failure {
        Some(failure) => RelayError::Upstream(failure),
        None => RelayError::Local {
            status: 504,
            code: "request_deadline_exceeded".to_string(),
            message: "request deadline exceeded before any upstream attempt".to_string(),
        },
    };
    Err(RelayFailure { error, trace })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::directory::SnapshotDirectory;
    use crate::gateway::error::SATURATED_MESSAGE;
    use crate::gateway::upstream::outcome::SuccessBody;
    use bytes::Bytes;
    use channelrelay_core::relay::ErrorBody;
    use channelrelay_core::storage::{Ability, CHANNEL_STATUS_MANUALLY_DISABLED};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted executor: per-channel status, recorded call order.
    struct ScriptedExecutor {
        statuses: HashMap<i64, u16>,
        calls: Mutex<Vec<i64>>,
    }

    impl ScriptedExecutor {
        fn new(statuses: &[(i64, u16)]) -> Self {
            Self {
                statuses: statuses.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<i64> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }
    }

    impl RelayExecutor for ScriptedExecutor {
        fn execute(&self, channel: &Channel, _request: &ExecuteRequest<'_>) -> Outcome {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(channel.id);
            }
            let status = self.statuses.get(&channel.id).copied().unwrap_or(200);
            if status == 0 {
                return Outcome::Failure(UpstreamFailure::local("do_request_failed", "refused"));
            }
            if (200..300).contains(&status) {
                return Outcome::Success(UpstreamSuccess {
                    status,
                    headers: Vec::new(),
                    body: SuccessBody::Buffered(Bytes::from_static(b"{}")),
                });
            }
            Outcome::Failure(UpstreamFailure::from_upstream(
                status,
                ErrorBody {
                    message: format!("upstream {status}"),
                    ..ErrorBody::default()
                },
            ))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        failed: Mutex<Vec<(i64, u16)>>,
    }

    impl ChannelErrorSink for RecordingSink {
        fn channel_failed(&self, channel: &Channel, failure: &UpstreamFailure) {
            if let Ok(mut failed) = self.failed.lock() {
                failed.push((channel.id, failure.status));
            }
        }
    }

    fn ability(channel_id: i64, priority: i64, weight: i64) -> Ability {
        Ability {
            group: "default".to_string(),
            model: "gpt-4".to_string(),
            channel_id,
            enabled: true,
            priority,
            weight,
            supports_image: true,
            supports_stream: true,
            supports_system_prompt: true,
            supports_non_deterministic: true,
            supports_function_call: true,
            max_input_tokens: 0,
        }
    }

    fn directory(rows: Vec<Ability>, extra: Vec<Channel>) -> SnapshotDirectory {
        let mut channels: Vec<Channel> = rows
            .iter()
            .map(|row| Channel {
                id: row.channel_id,
                priority: row.priority,
                weight: row.weight,
                models: "gpt-4".to_string(),
                ..Channel::default()
            })
            .collect();
        channels.extend(extra);
        SnapshotDirectory::from_parts(rows, channels)
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            model: "gpt-4".to_string(),
            group: "default".to_string(),
            ..Fingerprint::default()
        }
    }

    fn run(
        directory: &SnapshotDirectory,
        executor: &ScriptedExecutor,
        sink: &RecordingSink,
        budget: usize,
        pinned: Option<&str>,
    ) -> Result<Delivery<u16>, RelayFailure> {
        let fingerprint = fingerprint();
        let body = RewindableBody::from_bytes(b"{}".to_vec());
        let request = RelayRequest {
            trace_id: "trc_test",
            request_id: "req-1",
            mode: RelayMode::ChatCompletions,
            fingerprint: &fingerprint,
            body: &body,
            pinned_channel: pinned,
            deadline: RequestDeadline::unbounded(),
        };
        let mut rng = StdRng::seed_from_u64(17);
        run_relay(
            directory,
            executor,
            sink,
            RelayPolicy {
                retry_budget: budget,
            },
            &request,
            &mut rng,
            |_, success| Ok(success.status),
        )
    }

    #[test]
    fn saturated_tiers_surface_rate_limit_after_budget() {
        let directory = directory(
            vec![ability(1, 10, 0), ability(2, 10, 10), ability(3, 5, 5)],
            Vec::new(),
        );
        let executor = ScriptedExecutor::new(&[(1, 429), (2, 429), (3, 429)]);
        let sink = RecordingSink::default();

        let failure = run(&directory, &executor, &sink, 2, None).unwrap_err();

        assert_eq!(failure.error.status_code(), 429);
        assert_eq!(
            failure.error.client_message("req-1"),
            format!("{SATURATED_MESSAGE} (request id: req-1)")
        );
        let ids = failure.trace.channel_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] == 1 || ids[0] == 2);
        assert_eq!(ids[1], 3);
        assert_eq!(failure.trace.attempts()[1].priority, 5);
        assert_eq!(sink.failed.lock().map(|f| f.len()).unwrap_or(0), 2);
    }

    #[test]
    fn retry_moves_to_lower_tier_and_delivers() {
        let directory = directory(vec![ability(1, 10, 0), ability(2, 0, 0)], Vec::new());
        let executor = ScriptedExecutor::new(&[(1, 502), (2, 200)]);
        let sink = RecordingSink::default();

        let delivery = run(&directory, &executor, &sink, 3, None).expect("delivered");

        assert_eq!(delivery.channel.id, 2);
        assert_eq!(delivery.payload, 200);
        assert_eq!(delivery.trace.joined(), "1->2");
        assert_eq!(delivery.trace.attempts()[0].failure_status, Some(502));
        assert_eq!(delivery.trace.attempts()[1].failure_status, None);
        assert_eq!(delivery.trace.detailed(), "1(p10,502)->2(p0,ok)");
    }

    #[test]
    fn non_retryable_failures_stop_immediately() {
        for status in [400u16, 408, 504, 524, 0] {
            let directory = directory(vec![ability(1, 10, 0), ability(2, 0, 0)], Vec::new());
            let executor = ScriptedExecutor::new(&[(1, status), (2, 200)]);
            let sink = RecordingSink::default();
            let failure = run(&directory, &executor, &sink, 3, None).unwrap_err();
            assert_eq!(executor.calls(), vec![1], "status {status}");
            assert_eq!(failure.trace.len(), 1);
        }
    }

    #[test]
    fn budget_of_one_never_retries() {
        let directory = directory(vec![ability(1, 10, 0), ability(2, 0, 0)], Vec::new());
        let executor = ScriptedExecutor::new(&[(1, 500), (2, 200)]);
        let sink = RecordingSink::default();
        let failure = run(&directory, &executor, &sink, 1, None).unwrap_err();
        assert_eq!(failure.error.status_code(), 500);
        assert_eq!(executor.calls(), vec![1]);
    }

    #[test]
    fn lowest_tier_is_reused_when_attempts_outnumber_tiers() {
        let directory = directory(vec![ability(1, 10, 0), ability(2, 0, 0)], Vec::new());
        let executor = ScriptedExecutor::new(&[(1, 503), (2, 503)]);
        let sink = RecordingSink::default();
        let failure = run(&directory, &executor, &sink, 4, None).unwrap_err();
        assert_eq!(failure.trace.joined(), "1->2->2->2");
        assert_eq!(failure.error.status_code(), 503);
    }

    #[test]
    fn no_candidate_on_first_attempt_is_reported() {
        let directory = directory(Vec::new(), Vec::new());
        let executor = ScriptedExecutor::new(&[]);
        let sink = RecordingSink::default();
        let failure = run(&directory, &executor, &sink, 3, None).unwrap_err();
        assert!(matches!(failure.error, RelayError::NoCandidate { .. }));
        assert!(failure.trace.is_empty());
    }

    #[test]
    fn accept_rejection_is_classified_like_upstream_failure() {
        let directory = directory(vec![ability(1, 10, 0), ability(2, 0, 0)], Vec::new());
        let executor = ScriptedExecutor::new(&[(1, 200), (2, 200)]);
        let sink = RecordingSink::default();
        let fingerprint = fingerprint();
        let body = RewindableBody::from_bytes(b"{}".to_vec());
        let request = RelayRequest {
            trace_id: "trc_test",
            request_id: "req-2",
            mode: RelayMode::ChatCompletions,
            fingerprint: &fingerprint,
            body: &body,
            pinned_channel: None,
            deadline: RequestDeadline::unbounded(),
        };
        let mut rng = StdRng::seed_from_u64(3);
        let delivery = run_relay(
            &directory,
            &executor,
            &sink,
            RelayPolicy { retry_budget: 3 },
            &request,
            &mut rng,
            |channel, _| {
                if channel.id == 1 {
                    Err(AcceptError::Failure(UpstreamFailure {
                        status: 502,
                        message: "error envelope".to_string(),
                        error_type: "server_error".to_string(),
                        code: "openai_api_error".to_string(),
                        local: false,
                    }))
                } else {
                    Ok(channel.id)
                }
            },
        )
        .expect("delivered");
        assert_eq!(delivery.payload, 2);
        assert_eq!(delivery.trace.joined(), "1->2");
    }

    #[test]
    fn terminal_accept_error_stops_the_relay() {
        let directory = directory(vec![ability(1, 10, 0), ability(2, 0, 0)], Vec::new());
        let executor = ScriptedExecutor::new(&[]);
        let sink = RecordingSink::default();
        let fingerprint = fingerprint();
        let body = RewindableBody::default();
        let request = RelayRequest {
            trace_id: "trc_test",
            request_id: "req-3",
            mode: RelayMode::ChatCompletions,
            fingerprint: &fingerprint,
            body: &body,
            pinned_channel: None,
            deadline: RequestDeadline::unbounded(),
        };
        let mut rng = StdRng::seed_from_u64(3);
        let failure = run_relay::<(), _, _>(
            &directory,
            &executor,
            &sink,
            RelayPolicy { retry_budget: 3 },
            &request,
            &mut rng,
            |_, _| {
                Err(AcceptError::Terminal(RelayError::Transform {
                    code: "unmarshal_response_body_failed".to_string(),
                    message: "bad json".to_string(),
                }))
            },
        )
        .unwrap_err();
        assert_eq!(failure.error.status_code(), 500);
        assert_eq!(executor.calls(), vec![1]);
    }

    #[test]
    fn pinned_channel_is_used_once_and_never_retried() {
        let directory = directory(vec![ability(1, 10, 0), ability(2, 0, 0)], Vec::new());
        let executor = ScriptedExecutor::new(&[(2, 429)]);
        let sink = RecordingSink::default();
        let failure = run(&directory, &executor, &sink, 3, Some("2")).unwrap_err();
        assert_eq!(failure.error.status_code(), 429);
        assert_eq!(executor.calls(), vec![2]);

        let executor = ScriptedExecutor::new(&[]);
        let delivery = run(&directory, &executor, &sink, 3, Some(" 1 ")).expect("pinned");
        assert_eq!(delivery.channel.id, 1);
    }

    #[test]
    fn pinned_channel_validation() {
        let disabled = Channel {
            id: 9,
            status: CHANNEL_STATUS_MANUALLY_DISABLED,
            ..Channel::default()
        };
        let directory = directory(vec![ability(1, 0, 0)], vec![disabled]);
        let executor = ScriptedExecutor::new(&[]);
        let sink = RecordingSink::default();

        let cases = [("abc", 400u16), ("42", 400), ("9", 403)];
        for (raw, status) in cases {
            let failure = run(&directory, &executor, &sink, 3, Some(raw)).unwrap_err();
            assert!(matches!(failure.error, RelayError::PinnedChannel { .. }), "{raw}");
            assert_eq!(failure.error.status_code(), status, "{raw}");
        }
        assert!(executor.calls().is_empty());
    }
}
