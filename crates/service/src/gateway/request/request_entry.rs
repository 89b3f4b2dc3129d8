use channelrelay_core::relay::Usage;
use channelrelay_core::storage::{now_ts, Channel};
use rand::Rng;
use serde_json::json;
use std::io::{Cursor, Read};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tiny_http::{Header, Request, Response, StatusCode};

use super::buffered_relay::{transform_buffered, BufferedInput, BufferedRelay};
use super::capability::{extract_capabilities, CapabilityScan, Fingerprint, RelayMode};
use super::directory::{shared_directory, AbilityDirectory};
use super::error::RelayError;
use super::incoming_headers::IncomingHeaderSnapshot;
use super::rewindable_body::RewindableBody;
use super::rewrite::response_model_alias;
use super::runtime_config::{
    default_group, front_max_body_bytes, stream_drain_grace, stream_queue_capacity,
};
use super::stream_relay::{start_stream_relay, StreamRelayOptions};
use super::token_estimator::{default_counter, TokenCounter};
use super::trace_log;
use super::upstream::channel_health::AutoDisableSink;
use super::upstream::deadline::RequestDeadline;
use super::upstream::orchestrator::{run_relay, RelayPolicy, RelayRequest};
use super::upstream::outcome::{AcceptError, SuccessBody, UpstreamSuccess};
use super::upstream::transport::HttpRelayExecutor;

pub(crate) const HEADER_RELAY_ATTEMPTS: &str = "X-Relay-Attempts";
const HEADER_REQUEST_ID_OUT: &str = "X-Request-Id";
const MODELS_CREATED_AT: i64 = 1_626_777_600;

/// Accepted upstream answer, shaped for the client but not yet written.
enum PreparedResponse {
    Buffered(BufferedRelay),
    Stream {
        status: u16,
        body: Box<dyn Read + Send>,
    },
}

struct RequestContext {
    trace_id: String,
    request_id: String,
    started_at: Instant,
}

impl RequestContext {
    fn new(headers: &IncomingHeaderSnapshot) -> Self {
        let request_id = headers
            .request_id()
            .map(str::to_string)
            .unwrap_or_else(|| generate_request_id(&mut rand::thread_rng()));
        Self {
            trace_id: trace_log::next_trace_id(),
            request_id,
            started_at: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}

/// `<unix millis><8 random digits>`
pub(crate) fn generate_request_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis())
        .unwrap_or(0);
    format!("{millis}{:08}", rng.gen_range(0..100_000_000u32))
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn base_headers(request_id: &str, attempts: &str) -> Vec<Header> {
    let mut headers = Vec::with_capacity(3);
    headers.extend(header(HEADER_REQUEST_ID_OUT, request_id));
    if !attempts.is_empty() {
        headers.extend(header(HEADER_RELAY_ATTEMPTS, attempts));
    }
    headers
}

pub(crate) fn respond_json(request: Request, status: u16, body: Vec<u8>, mut headers: Vec<Header>) {
    headers.extend(header("Content-Type", "application/json"));
    let len = Some(body.len());
    let response = Response::new(StatusCode(status), headers, Cursor::new(body), len, None);
    let _ = request.respond(response);
}

fn respond_relay_error(request: Request, ctx: &RequestContext, error: &RelayError, attempts: &str) {
    let status = error.status_code();
    let body = error.to_envelope(&ctx.request_id).to_json_bytes();
    respond_json(request, status, body, base_headers(&ctx.request_id, attempts));
}

fn finish_with_error(request: Request, ctx: &RequestContext, error: &RelayError, attempts: &str) {
    log::warn!(
        "event=gateway_request_failed request_id={} status={} attempts={} err={}",
        ctx.request_id,
        error.status_code(),
        if attempts.is_empty() { "-" } else { attempts },
        error
    );
    trace_log::log_request_final(
        &ctx.trace_id,
        error.status_code(),
        ctx.elapsed_ms(),
        0,
        0,
        Some(&error.to_string()),
    );
    respond_relay_error(request, ctx, error, attempts);
}

fn accept_upstream<'a>(
    fingerprint: &'a Fingerprint,
    counter: &'a dyn TokenCounter,
) -> impl FnMut(&Channel, UpstreamSuccess) -> Result<PreparedResponse, AcceptError> + 'a {
    move |_channel: &Channel, success: UpstreamSuccess| match success.body {
        SuccessBody::Stream(body) => Ok(PreparedResponse::Stream {
            status: success.status,
            body,
        }),
        SuccessBody::Buffered(bytes) => {
            let relay = transform_buffered(
                BufferedInput {
                    status: success.status,
                    headers: &success.headers,
                    body: &bytes,
                    origin_model: &fingerprint.model,
                    prompt_tokens: fingerprint.estimated_input_tokens as i64,
                },
                counter,
                &mut rand::thread_rng(),
            )?;
            Ok(PreparedResponse::Buffered(relay))
        }
    }
}

fn scan_request(
    mode: RelayMode,
    headers: &IncomingHeaderSnapshot,
    body: &RewindableBody,
    counter: &dyn TokenCounter,
) -> Result<Fingerprint, RelayError> {
    let group = headers
        .group()
        .map(str::to_string)
        .unwrap_or_else(default_group);
    match extract_capabilities(
        Some(mode),
        headers.is_multipart(),
        &group,
        body.bytes(),
        counter,
    ) {
        CapabilityScan::Fingerprint(fingerprint) if fingerprint.model.is_empty() => {
            Err(RelayError::InvalidRequest {
                message: "model is required".to_string(),
            })
        }
        CapabilityScan::Fingerprint(fingerprint) => Ok(fingerprint),
        CapabilityScan::NotApplicable => Err(RelayError::InvalidRequest {
            message: "unsupported request content type".to_string(),
        }),
    }
}

/// Relays one OpenAI-compatible request (`/v1/chat/completions`, `/v1/completions`,
/// `/v1/embeddings`, `/v1/moderations`) and writes the response.
pub(crate) fn handle_gateway_request(mut request: Request) {
    let headers = IncomingHeaderSnapshot::from_request(&request);
    let ctx = RequestContext::new(&headers);
    let path = request.url().to_string();
    let Some(mode) = RelayMode::from_path(&path) else {
        let error = RelayError::Local {
            status: 404,
            code: "not_found".to_string(),
            message: format!("unknown relay path {path}"),
        };
        finish_with_error(request, &ctx, &error, "");
        return;
    };

    let body = match RewindableBody::capture(request.as_reader(), front_max_body_bytes()) {
        Ok(body) => body,
        Err(error) => {
            finish_with_error(request, &ctx, &error, "");
            return;
        }
    };
    let counter = default_counter();
    let fingerprint = match scan_request(mode, &headers, &body, counter) {
        Ok(fingerprint) => fingerprint,
        Err(error) => {
            finish_with_error(request, &ctx, &error, "");
            return;
        }
    };
    trace_log::log_request_start(
        &ctx.trace_id,
        &ctx.request_id,
        &path,
        &fingerprint.group,
        &fingerprint.model,
        fingerprint.needs_stream,
    );

    let directory = shared_directory();
    let sink = AutoDisableSink::new(directory.clone());
    let relay_request = RelayRequest {
        trace_id: &ctx.trace_id,
        request_id: &ctx.request_id,
        mode,
        fingerprint: &fingerprint,
        body: &body,
        pinned_channel: headers.pinned_channel(),
        deadline: RequestDeadline::from_config(ctx.started_at, fingerprint.needs_stream),
    };
    let result = run_relay(
        directory.as_ref(),
        &HttpRelayExecutor,
        &sink,
        RelayPolicy::from_config(),
        &relay_request,
        &mut rand::thread_rng(),
        accept_upstream(&fingerprint, counter),
    );

    let delivery = match result {
        Ok(delivery) => delivery,
        Err(failure) => {
            finish_with_error(request, &ctx, &failure.error, &failure.trace.joined());
            return;
        }
    };
    let attempts = delivery.trace.joined();
    log::debug!(
        "event=gateway_relay_delivered request_id={} channel_id={} channel={} attempts={}",
        ctx.request_id,
        delivery.channel.id,
        delivery.channel.name,
        attempts
    );
    match delivery.payload {
        PreparedResponse::Buffered(relay) => {
            write_buffered(request, &ctx, relay, &attempts);
        }
        PreparedResponse::Stream { status, body } => {
            write_stream(request, &ctx, mode, &fingerprint, status, body, &attempts, counter);
        }
    }
}

fn write_buffered(request: Request, ctx: &RequestContext, relay: BufferedRelay, attempts: &str) {
    let mut headers = base_headers(&ctx.request_id, attempts);
    headers.extend(
        relay
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("content-length")
                    && !name.eq_ignore_ascii_case(HEADER_REQUEST_ID_OUT)
            })
            .filter_map(|(name, value)| header(name, value)),
    );
    let len = Some(relay.body.len());
    let status = relay.status;
    let usage = relay.usage;
    let response = Response::new(StatusCode(status), headers, Cursor::new(relay.body), len, None);
    let _ = request.respond(response);
    log_delivered(ctx, status, &usage, false);
}

#[allow(clippy::too_many_arguments)]
fn write_stream(
    request: Request,
    ctx: &RequestContext,
    mode: RelayMode,
    fingerprint: &Fingerprint,
    status: u16,
    upstream: Box<dyn Read + Send>,
    attempts: &str,
    counter: &dyn TokenCounter,
) {
    let options = StreamRelayOptions {
        mode,
        model_alias: response_model_alias(&fingerprint.model),
        queue_capacity: stream_queue_capacity(),
        drain_grace: stream_drain_grace(),
    };
    let (reader, handle) = match start_stream_relay(upstream, options) {
        Ok(started) => started,
        Err(err) => {
            let error = RelayError::Local {
                status: 500,
                code: "stream_relay_failed".to_string(),
                message: err,
            };
            finish_with_error(request, ctx, &error, attempts);
            return;
        }
    };

    let mut headers = base_headers(&ctx.request_id, attempts);
    headers.extend(header("Content-Type", "text/event-stream"));
    headers.extend(header("Cache-Control", "no-cache"));
    headers.extend(header("X-Accel-Buffering", "no"));
    let response = Response::new(StatusCode(status), headers, reader, None, None);
    let _ = request.respond(response);

    let summary = handle.join();
    let completion_tokens = counter.count_text(&summary.text, &fingerprint.model) as i64;
    let prompt_tokens = fingerprint.estimated_input_tokens as i64;
    let usage = Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    };
    if let Some(err) = summary.read_error.as_deref() {
        log::warn!(
            "event=stream_upstream_read_failed request_id={} err={}",
            ctx.request_id,
            err
        );
    }
    log::debug!(
        "event=stream_relay_done request_id={} forwarded={} skipped={} tool_calls={} saw_done={} cancelled={} first_byte_ms={}",
        ctx.request_id,
        summary.forwarded_frames,
        summary.skipped_frames,
        summary.tool_calls,
        summary.saw_done,
        summary.cancelled,
        summary
            .first_byte_at
            .map(|at| at.saturating_duration_since(ctx.started_at).as_millis().to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    log_delivered(ctx, status, &usage, summary.cancelled);
}

fn log_delivered(ctx: &RequestContext, status: u16, usage: &Usage, cancelled: bool) {
    let elapsed_ms = ctx.elapsed_ms();
    log::info!(
        "event=gateway_request_done request_id={} status={} elapsed_ms={} prompt_tokens={} completion_tokens={}",
        ctx.request_id,
        status,
        elapsed_ms,
        usage.prompt_tokens,
        usage.completion_tokens
    );
    trace_log::log_request_final(
        &ctx.trace_id,
        status,
        elapsed_ms,
        usage.prompt_tokens.max(0) as u64,
        usage.completion_tokens.max(0) as u64,
        cancelled.then_some("client_cancelled"),
    );
}

fn models_body(models: &[String]) -> Vec<u8> {
    let data: Vec<_> = models
        .iter()
        .map(|model| {
            json!({
                "id": model,
                "object": "model",
                "created": MODELS_CREATED_AT,
                "owned_by": "channelrelay",
            })
        })
        .collect();
    json!({ "object": "list", "data": data }).to_string().into_bytes()
}

/// `GET /v1/models`: models the caller's group can route to.
pub(crate) fn handle_models_request(request: Request) {
    let headers = IncomingHeaderSnapshot::from_request(&request);
    let group = headers
        .group()
        .map(str::to_string)
        .unwrap_or_else(default_group);
    let models = shared_directory().snapshot().group_models(&group);
    log::debug!(
        "event=gateway_models group={} count={} ts={}",
        group,
        models.len(),
        now_ts()
    );
    respond_json(request, 200, models_body(&models), Vec::new());
}
