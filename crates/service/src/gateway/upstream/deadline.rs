use std::time::{Duration, Instant};

use crate::gateway::runtime_config::{upstream_stream_timeout, upstream_total_timeout};

const MIN_SEND_TIMEOUT: Duration = Duration::from_millis(1);

/// Wall-clock budget of one client request, shared by every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RequestDeadline {
    at: Option<Instant>,
    is_stream: bool,
    stream_timeout: Option<Duration>,
}

fn overall_timeout(
    total_timeout: Option<Duration>,
    stream_timeout: Option<Duration>,
    is_stream: bool,
) -> Option<Duration> {
    if !is_stream {
        return total_timeout;
    }
    // 中文注释：流式请求取两者较大值，避免长流被总超时提前截断。
    match (total_timeout, stream_timeout) {
        (Some(total), Some(stream)) => Some(total.max(stream)),
        (total, stream) => total.or(stream),
    }
}

impl RequestDeadline {
    pub(crate) fn from_config(started_at: Instant, is_stream: bool) -> Self {
        Self::new(
            started_at,
            is_stream,
            upstream_total_timeout(),
            upstream_stream_timeout(),
        )
    }

    pub(crate) fn new(
        started_at: Instant,
        is_stream: bool,
        total_timeout: Option<Duration>,
        stream_timeout: Option<Duration>,
    ) -> Self {
        Self {
            at: overall_timeout(total_timeout, stream_timeout, is_stream)
                .map(|timeout| started_at + timeout),
            is_stream,
            stream_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn unbounded() -> Self {
        Self {
            at: None,
            is_stream: false,
            stream_timeout: None,
        }
    }

    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|remaining| remaining.is_zero())
    }

    /// Timeout for the next upstream send: what is left of the request budget,
    /// further capped by the stream timeout for streaming requests.
    pub(crate) fn send_timeout(&self) -> Option<Duration> {
        let remaining = self.remaining();
        let timeout = if self.is_stream {
            match (self.stream_timeout, remaining) {
                (Some(configured), Some(remaining)) => Some(configured.min(remaining)),
                (configured, remaining) => configured.or(remaining),
            }
        } else {
            remaining
        };
        timeout.map(|timeout| timeout.max(MIN_SEND_TIMEOUT))
    }
}
