use channelrelay_core::relay::ErrorEnvelope;
use tiny_http::{Method, Request};

use crate::gateway;

fn route_path(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

pub(crate) fn handle_request(request: Request) {
    let path = route_path(request.url()).trim_end_matches('/').to_string();
    let method = request.method().clone();
    match (&method, path.as_str()) {
        (Method::Get, "/health") => {
            let body = serde_json::json!({
                "status": "ok",
                "version": channelrelay_core::core_version(),
            });
            gateway::respond_json(request, 200, body.to_string().into_bytes(), Vec::new());
        }
        (Method::Get, "/v1/models") => gateway::handle_models_request(request),
        (Method::Post, relay_path) if gateway::is_relay_path(relay_path) => {
            gateway::handle_gateway_request(request)
        }
        (method, _) => {
            log::debug!("event=http_route_miss method={} path={}", method, path);
            let body = ErrorEnvelope::new(
                format!("route not found: {path}"),
                "invalid_request_error",
                "not_found",
            )
            .to_json_bytes();
            gateway::respond_json(request, 404, body, Vec::new());
        }
    }
}
