//! axum host adapter: runs admission control in front of upstream routes.

use crate::decision::Admission;
use crate::error::HostError;
use crate::host::{CallerContext, HostResult, RecordedResponse, RequestAccessors};
use crate::rules::SourceKind;
use axum::body::{Body, Bytes, HttpBody};
use axum::extract::{MatchedPath, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Header an upstream authenticator sets to identify the consumer.
pub const CONSUMER_HEADER: &str = "x-consumer-id";

/// Shared state for the admission middleware.
#[derive(Clone)]
pub struct AdmissionState {
    pub admission: Arc<Admission>,
    /// Reported as the service segment of every identity.
    pub service_id: Option<String>,
    /// Largest body buffered for body rules.
    pub body_limit: usize,
}

impl AdmissionState {
    pub fn new(admission: Admission) -> Self {
        Self {
            admission: Arc::new(admission),
            service_id: None,
            body_limit: 1024 * 1024,
        }
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }

    fn reads_body(&self) -> bool {
        self.admission.policy().is_some_and(|policy| {
            policy
                .rules
                .iter()
                .any(|rule| rule.sources.contains(&SourceKind::Body))
        })
    }
}

/// A request as seen by the engine.
struct HttpRequest<'a> {
    parts: &'a Parts,
    body: Option<&'a [u8]>,
    service_id: Option<&'a str>,
}

impl RequestAccessors for HttpRequest<'_> {
    fn header(&self, name: &str) -> HostResult<Option<String>> {
        self.parts
            .headers
            .get(name)
            .map(|value| value.to_str().map(str::to_string))
            .transpose()
            .map_err(|e| HostError::new(format!("header '{}': {}", name, e)))
    }

    fn query_arg(&self, name: &str) -> HostResult<Option<String>> {
        let Query(args) = Query::<Vec<(String, String)>>::try_from_uri(&self.parts.uri)
            .map_err(|e| HostError::new(format!("query: {}", e)))?;
        Ok(args
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value))
    }

    fn raw_body(&self) -> HostResult<Option<String>> {
        self.body
            .map(|bytes| std::str::from_utf8(bytes).map(str::to_string))
            .transpose()
            .map_err(|e| HostError::new(format!("body: {}", e)))
    }
}

impl CallerContext for HttpRequest<'_> {
    fn consumer_id(&self) -> HostResult<Option<String>> {
        self.header(CONSUMER_HEADER)
    }

    fn service_id(&self) -> HostResult<Option<String>> {
        Ok(self.service_id.map(str::to_string))
    }

    fn route_id(&self) -> HostResult<Option<String>> {
        Ok(self
            .parts
            .extensions
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_string()))
    }
}

/// Admission control middleware.
///
/// Install with `route_layer` so the matched route is known.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let span = info_span!("admission", request_id = %Uuid::new_v4());
    admit(state, request, next).instrument(span).await
}

async fn admit(state: AdmissionState, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();

    let (body, buffered) = if state.reads_body() {
        buffer_body(body, state.body_limit).await
    } else {
        (body, None)
    };

    let decision = {
        let view = HttpRequest {
            parts: &parts,
            body: buffered.as_deref(),
            service_id: state.service_id.as_deref(),
        };
        state.admission.check(&view).await
    };

    let mut recorded = RecordedResponse::default();
    decision.apply(&mut recorded);

    let mut response = match recorded.exit.take() {
        Some((status, message)) => {
            info!(
                target: "custom_ratelimit::middleware",
                method = %parts.method,
                uri = %parts.uri,
                "request denied"
            );
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
            (status, message).into_response()
        }
        None => {
            debug!(target: "custom_ratelimit::middleware", ?decision, "request admitted");
            next.run(Request::from_parts(parts, body)).await
        }
    };

    for (name, value) in recorded.headers {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(target: "custom_ratelimit::middleware", "skipping invalid response header"),
        }
    }

    response
}

/// Buffer a body of known size up to `limit` so body rules can read it.
///
/// Larger bodies and bodies of unknown size are forwarded untouched and left
/// out of matching. A read that fails part way leaves the body unreadable.
async fn buffer_body(body: Body, limit: usize) -> (Body, Option<Bytes>) {
    let size = body.size_hint().upper();
    if !size.is_some_and(|size| size <= limit as u64) {
        debug!(target: "custom_ratelimit::middleware", ?size, limit, "request body not inspected");
        return (body, None);
    }

    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => (Body::from(bytes.clone()), Some(bytes)),
        Err(err) => {
            warn!(target: "custom_ratelimit::middleware", error = %err, "failed to buffer request body");
            (Body::empty(), None)
        }
    }
}
