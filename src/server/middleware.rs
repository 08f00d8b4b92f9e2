use axum::{extract::Request, http::header, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ID stored in request extensions for correlation and debugging.
/// The proxy handler forwards it to the upstream registry.
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Middleware that tags each request with a UUID v4.
///
/// The ID is stored in the request extensions, attached to a tracing span
/// around the rest of the pipeline, and returned as `x-request-id`.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id.clone());

    let span = tracing::info_span!("request", request_id = %request_id.0);
    let mut response = next.run(request).instrument(span).await;

    response.headers_mut().insert(
        header::HeaderName::from_static(REQUEST_ID_HEADER),
        header::HeaderValue::from_str(&request_id.0.to_string())
            .unwrap_or_else(|_| header::HeaderValue::from_static("invalid")),
    );

    response
}
