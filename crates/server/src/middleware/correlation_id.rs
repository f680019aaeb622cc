//! Request correlation IDs.
//!
//! Every request carries an `X-Request-ID`: the caller's when present, a fresh UUID v4
//! otherwise. The ID is echoed on the response and recorded on the request's trace span, so a
//! sync triggered by a read can be followed through the gateway logs.

use axum::http::{header::HeaderValue, HeaderName, Request};
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use uuid::Uuid;

/// The header name for request correlation IDs.
pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// A UUID v4 generator for request IDs.
#[derive(Clone, Copy, Default)]
pub struct UuidRequestIdGenerator;

impl MakeRequestId for UuidRequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = Uuid::new_v4().to_string();
        Some(RequestId::new(HeaderValue::from_str(&id).ok()?))
    }
}

/// Returns the `(set, propagate)` layer pair. Apply `propagate` first and `set` last so the ID
/// exists before it is copied to the response.
pub fn create_request_id_layers(
) -> (SetRequestIdLayer<UuidRequestIdGenerator>, PropagateRequestIdLayer) {
    (
        SetRequestIdLayer::new(X_REQUEST_ID.clone(), UuidRequestIdGenerator),
        PropagateRequestIdLayer::new(X_REQUEST_ID.clone()),
    )
}

/// Reads the correlation ID set by [`create_request_id_layers`].
#[must_use]
pub fn request_id<B>(request: &Request<B>) -> Option<&str> {
    request.headers().get(&X_REQUEST_ID).and_then(|v| v.to_str().ok())
}
