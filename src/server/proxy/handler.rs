use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    response::Response,
};

use super::interceptor::MirrorRequest;
use crate::server::error::ProxyError;
use crate::server::middleware::{RequestId, REQUEST_ID_HEADER};
use crate::server::mirror::{rewrite, Rewrite};
use crate::server::registry::OutboundRequest;
use crate::server::state::AppState;

/// Registry pulls carry no meaningful request body; anything larger is refused.
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

/// Proxy a registry request: rewrite it, forward it, and stream the answer back.
pub async fn proxy(State(state): State<AppState>, request: Request) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let rewrite = rewrite(&state.config, &parts.method, &parts.uri)?;

    let body = to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(ProxyError::Body)?;
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    let request_id = parts
        .extensions
        .get::<RequestId>()
        .and_then(|id| HeaderValue::from_str(&id.0.to_string()).ok());

    let upstream = match rewrite {
        Rewrite::PassThrough { url, .. } => {
            state
                .interceptor
                .pass_through(OutboundRequest {
                    method: parts.method,
                    url,
                    headers,
                    body,
                })
                .await?
        }
        Rewrite::Mirror {
            url,
            destination,
            context,
        } => {
            // Only mirrored requests carry the id upstream
            if let Some(value) = request_id {
                headers.insert(REQUEST_ID_HEADER, value);
            }
            let on_missing = context
                .as_ref()
                .and_then(|c| state.config.rule(&c.source_alias))
                .and_then(|rule| rule.on_missing_template.as_ref());

            state
                .interceptor
                .forward(MirrorRequest {
                    request: OutboundRequest {
                        method: parts.method,
                        url,
                        headers,
                        body,
                    },
                    destination: &destination,
                    context: context.as_ref(),
                    on_missing,
                })
                .await?
        }
    };

    Ok(into_response(upstream))
}

fn into_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}
