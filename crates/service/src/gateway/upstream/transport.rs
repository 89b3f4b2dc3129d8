use bytes::Bytes;
use channelrelay_core::storage::Channel;
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;

use super::deadline::RequestDeadline;
use super::executor::{
    body_for_upstream, mapped_model, mapped_status, parse_error_body, ExecuteRequest,
    RelayExecutor,
};
use super::outcome::{Outcome, SuccessBody, UpstreamFailure, UpstreamSuccess};
use super::protocol::{build_target, UpstreamTarget};
use crate::gateway::runtime_config::{fresh_upstream_client, upstream_client};

/// Executor backed by the shared blocking `reqwest` client.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HttpRelayExecutor;

fn send_upstream_request(
    client: &Client,
    target: &UpstreamTarget,
    body: &Bytes,
    deadline: RequestDeadline,
) -> Result<Response, reqwest::Error> {
    let build_request = |http: &Client| {
        let mut builder = http.post(target.url.as_str());
        if let Some(timeout) = deadline.send_timeout() {
            builder = builder.timeout(timeout);
        }
        for (name, value) in target.headers.iter() {
            builder = builder.header(name.clone(), value.clone());
        }
        builder.body(body.clone())
    };

    match build_request(client).send() {
        Ok(resp) => Ok(resp),
        Err(first_err) => {
            // 中文注释：单例 client 的连接池可能持有已失效的连接，换新 client 立即重试一次。
            let fresh = fresh_upstream_client();
            match build_request(&fresh).send() {
                Ok(resp) => Ok(resp),
                Err(_) => Err(first_err),
            }
        }
    }
}

fn response_headers(response: &Response) -> Vec<(String, String)> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("text/event-stream"))
}

impl RelayExecutor for HttpRelayExecutor {
    fn execute(&self, channel: &Channel, request: &ExecuteRequest<'_>) -> Outcome {
        let requested_model = request.fingerprint.model.as_str();
        let upstream_model = mapped_model(channel, requested_model);
        let body = match body_for_upstream(request.body, requested_model, &upstream_model) {
            Ok(body) => body,
            Err(err) => return Outcome::Failure(UpstreamFailure::local("convert_request_failed", err)),
        };
        let target = match build_target(
            channel,
            request.mode,
            &upstream_model,
            request.fingerprint.needs_stream,
        ) {
            Ok(target) => target,
            Err(err) => return Outcome::Failure(UpstreamFailure::local("invalid_channel_config", err)),
        };

        let response = match send_upstream_request(upstream_client(), &target, &body, request.deadline) {
            Ok(response) => response,
            Err(err) => {
                log::warn!(
                    "event=upstream_send_failed request_id={} channel_id={} err={}",
                    request.request_id,
                    channel.id,
                    err
                );
                return Outcome::Failure(UpstreamFailure::local(
                    "do_request_failed",
                    format!("do request failed: {err}"),
                ));
            }
        };

        let status = response.status().as_u16();
        let headers = response_headers(&response);
        if !response.status().is_success() {
            let raw = response.bytes().unwrap_or_default();
            let error = parse_error_body(&raw);
            return Outcome::Failure(UpstreamFailure::from_upstream(
                mapped_status(channel, status),
                error,
            ));
        }

        let body = if request.fingerprint.needs_stream && is_event_stream(&response) {
            SuccessBody::Stream(Box::new(response))
        } else {
            match response.bytes() {
                Ok(bytes) => SuccessBody::Buffered(bytes),
                Err(err) => {
                    return Outcome::Failure(UpstreamFailure::local(
                        "read_response_body_failed",
                        format!("read response body failed: {err}"),
                    ))
                }
            }
        };
        Outcome::Success(UpstreamSuccess {
            status,
            headers,
            body,
        })
    }
}
