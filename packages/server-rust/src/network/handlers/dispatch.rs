//! Route dispatch: envelope validation, payload validation, handler call and
//! the single error formatter shared by every route and the fallback.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header::ACCEPT_LANGUAGE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use meshkit_core::envelope::UNKNOWN_TRACE_ID;
use meshkit_core::{
    parse_envelope, BaseError, Envelope, ErrorBody, ErrorEnvelope, ErrorTranslator, Meta,
    MetaStamp,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, field, info_span, Instrument};

use super::AppState;
use crate::controller::{HandlerContext, RouteBinding};
use crate::remote::CallError;

/// Echo of the response status, independent of the status line.
pub const X_STATUS_CODE: HeaderName = HeaderName::from_static("x-status-code");

/// Echo of `meta.request.traceId`.
pub const X_TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");

/// Explicit language selection through the query string.
#[derive(Debug, Default, Deserialize)]
pub struct LanguageQuery {
    pub lng: Option<String>,
}

/// Per-request pipeline position. Each transition is one awaited step.
#[derive(Debug)]
enum Stage {
    Received(Bytes),
    EnvelopeValidated(Envelope),
    PayloadValidated(Envelope),
    Handled { meta: Meta, result: Value },
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Self::Received(_) => "received",
            Self::EnvelopeValidated(_) => "envelope_validated",
            Self::PayloadValidated(_) => "payload_validated",
            Self::Handled { .. } => "handled",
        }
    }
}

/// Runs route requests through the stage pipeline and renders every outcome
/// as an envelope.
#[derive(Debug)]
pub struct Dispatcher {
    translator: ErrorTranslator,
    stamp: MetaStamp,
    context: HandlerContext,
}

impl Dispatcher {
    #[must_use]
    pub fn new(translator: ErrorTranslator, stamp: MetaStamp, context: HandlerContext) -> Self {
        Self {
            translator,
            stamp,
            context,
        }
    }

    #[must_use]
    pub fn translator(&self) -> &ErrorTranslator {
        &self.translator
    }

    /// One `POST` route per binding.
    pub fn routes(bindings: Vec<RouteBinding>) -> Router<AppState> {
        bindings.into_iter().fold(Router::new(), |router, binding| {
            let path = binding.path.as_str().to_string();
            let binding = Arc::new(binding);
            router.route(
                &path,
                post(
                    move |State(state): State<AppState>,
                          query: Result<Query<LanguageQuery>, QueryRejection>,
                          headers: HeaderMap,
                          body: Bytes| {
                        let binding = Arc::clone(&binding);
                        async move {
                            let language = state.dispatcher.language(query, &headers);
                            let _guard = state.shutdown.in_flight_guard();
                            state.dispatcher.dispatch(&binding, &language, body).await
                        }
                    },
                ),
            )
        })
    }

    fn language(
        &self,
        query: Result<Query<LanguageQuery>, QueryRejection>,
        headers: &HeaderMap,
    ) -> String {
        let explicit = query.ok().and_then(|Query(q)| q.lng);
        let accept = headers
            .get(ACCEPT_LANGUAGE)
            .and_then(|value| value.to_str().ok());
        self.translator
            .catalog()
            .negotiate(explicit.as_deref(), accept)
    }

    /// Drives one request from `Received` to a response.
    pub async fn dispatch(&self, route: &RouteBinding, language: &str, body: Bytes) -> Response {
        let span = info_span!(
            "dispatch",
            route = %route.path,
            trace_id = field::Empty,
            stage = field::Empty,
            outcome = field::Empty,
            status = field::Empty,
            duration_ms = field::Empty,
        );
        let started = Instant::now();

        async {
            let mut echo = None;
            let mut stage = Stage::Received(body);
            let outcome = loop {
                tracing::Span::current().record("stage", stage.name());
                match self.advance(route, stage, &mut echo).await {
                    Ok(Stage::Handled { meta, result }) => break Ok((meta, result)),
                    Ok(next) => stage = next,
                    Err(e) => break Err(e),
                }
            };

            let response = match outcome {
                Ok((meta, result)) => self.success(&meta, result),
                Err(e) => self.failure(e, echo.as_ref(), language),
            };

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = started.elapsed().as_millis() as u64;
            let status = response.status().as_u16();
            let span = tracing::Span::current();
            span.record("status", status);
            span.record("outcome", if status < 400 { "ok" } else { "error" });
            span.record("duration_ms", duration_ms);
            debug!(status, duration_ms, "request handled");
            response
        }
        .instrument(span)
        .await
    }

    async fn advance(
        &self,
        route: &RouteBinding,
        stage: Stage,
        echo: &mut Option<Value>,
    ) -> anyhow::Result<Stage> {
        match stage {
            Stage::Received(body) => {
                let value: Value =
                    serde_json::from_slice(&body).map_err(|_| BaseError::malformed_body())?;
                *echo = value.get("meta").cloned();
                let envelope = parse_envelope(value).map_err(BaseError::from)?;
                tracing::Span::current().record("trace_id", envelope.meta.trace_id());
                Ok(Stage::EnvelopeValidated(envelope))
            }
            Stage::EnvelopeValidated(envelope) => {
                route
                    .schema
                    .validate(&envelope.data)
                    .map_err(BaseError::from)?;
                Ok(Stage::PayloadValidated(envelope))
            }
            Stage::PayloadValidated(envelope) => {
                let meta = envelope.meta.clone();
                let params = self.context.params(envelope.data, envelope.meta);
                let result = (route.handler)(params).await?;
                Ok(Stage::Handled { meta, result })
            }
            handled @ Stage::Handled { .. } => Ok(handled),
        }
    }

    fn success(&self, meta: &Meta, result: Value) -> Response {
        let data = if result.is_null() { json!({}) } else { result };
        let envelope = Envelope::new(self.stamp.stamp(meta), data);
        respond(StatusCode::OK.as_u16(), meta.trace_id(), &envelope)
    }

    /// The single error formatter. Taxonomy errors (local or relayed from a
    /// remote service) are rendered; anything else is logged and reported
    /// as an opaque internal error.
    fn failure(&self, err: anyhow::Error, echo: Option<&Value>, language: &str) -> Response {
        let body = self.render(&err, language);
        let envelope = ErrorEnvelope {
            meta: echo.and_then(|meta| self.stamp.stamp_loose(meta)),
            error: body,
        };
        respond(envelope.error.status, envelope.trace_id(), &envelope)
    }

    fn render(&self, err: &anyhow::Error, language: &str) -> ErrorBody {
        if let Some(base) = err.downcast_ref::<BaseError>() {
            return self.translator.render(base, language);
        }
        if let Some(CallError::Remote(base)) = err.downcast_ref::<CallError>() {
            return self.translator.render(base, language);
        }
        error!(error = ?err, "unexpected failure");
        self.translator.render_unexpected(language)
    }

    /// Response for paths no controller registered. The body's `meta` is
    /// echoed when the body is JSON.
    #[must_use]
    pub fn not_found(&self, path: &str, body: &[u8], language: &str) -> Response {
        let echo = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|mut value| value.get_mut("meta").map(Value::take));
        self.failure(BaseError::path_not_found(path).into(), echo.as_ref(), language)
    }
}

fn respond(status: u16, trace_id: &str, body: &impl Serialize) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (code, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(X_STATUS_CODE, HeaderValue::from(status));
    let trace_id = HeaderValue::from_str(trace_id)
        .unwrap_or_else(|_| HeaderValue::from_static(UNKNOWN_TRACE_ID));
    headers.insert(X_TRACE_ID, trace_id);
    response
}

/// Catch-all for unmatched paths and methods.
pub async fn fallback_handler(
    State(state): State<AppState>,
    query: Result<Query<LanguageQuery>, QueryRejection>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let language = state.dispatcher.language(query, &headers);
    state.dispatcher.not_found(uri.path(), &body, &language)
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use meshkit_core::{FieldRule, ObjectSchema};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::controller::{Controller, ControllerRegistry, Params};
    use crate::network::handlers::tests::test_state;

    fn registry() -> ControllerRegistry {
        let mut registry = ControllerRegistry::new();
        registry
            .register(
                Controller::on(["/plus"], |params: Params| async move {
                    #[derive(Deserialize)]
                    struct Operands {
                        a: f64,
                        b: f64,
                    }
                    let Operands { a, b } = params.parse()?;
                    Ok(json!({ "result": a + b }))
                })
                .validator(
                    ObjectSchema::new()
                        .field("a", FieldRule::number().required())
                        .field("b", FieldRule::number().required()),
                )
                .build()
                .unwrap(),
            )
            .unwrap();
        registry
            .register(
                Controller::on(["/conflict"], |_params: Params| async move {
                    Err(BaseError::business("Order already shipped", 409)
                        .untranslated()
                        .into())
                })
                .build()
                .unwrap(),
            )
            .unwrap();
        registry
            .register(
                Controller::on(["/explode"], |_params: Params| async move {
                    Err(anyhow::anyhow!("database password is hunter2"))
                })
                .build()
                .unwrap(),
            )
            .unwrap();
        registry
            .register(
                Controller::on(["/nothing"], |_params: Params| async move { Ok(Value::Null) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn app() -> Router {
        crate::network::build_router(
            test_state(),
            registry().route_bindings(),
            &crate::network::NetworkConfig::default(),
        )
    }

    fn envelope(data: Value) -> Value {
        json!({
            "meta": {
                "serviceId": "gateway",
                "timestamp": "2024-01-01T00:00:00.000Z",
                "originId": "o-1",
                "request": {"traceId": "trace-42", "ipAddress": "10.1.2.3", "userId": "u-1"}
            },
            "data": data
        })
    }

    async fn post(uri: &str, body: impl Into<Body>) -> (StatusCode, HeaderMap, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn success_wraps_result_with_regenerated_meta() {
        let (status, headers, body) =
            post("/plus", envelope(json!({"a": 2, "b": 3})).to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"result": 5.0}));
        assert_eq!(body["meta"]["serviceId"], "calc");
        assert_eq!(body["meta"]["request"]["traceId"], "trace-42");
        assert!(body["meta"].get("originId").is_none());
        assert_ne!(body["meta"]["timestamp"], "2024-01-01T00:00:00.000Z");
        assert_eq!(headers[X_STATUS_CODE], "200");
        assert_eq!(headers[X_TRACE_ID], "trace-42");
    }

    #[tokio::test]
    async fn null_result_becomes_empty_object() {
        let (status, _, body) = post("/nothing", envelope(json!({})).to_string()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({}));
    }

    #[tokio::test]
    async fn empty_meta_names_first_missing_field() {
        let (status, headers, body) =
            post("/plus?lng=en", json!({"meta": {}, "data": {}}).to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "internal");
        assert_eq!(body["error"]["status"], 400);
        assert_eq!(body["error"]["message"], "\"meta.serviceId\" is required");
        assert_eq!(headers[X_STATUS_CODE], "400");
        assert_eq!(headers[X_TRACE_ID], "unknown");
    }

    #[tokio::test]
    async fn payload_violation_names_the_field() {
        let (status, headers, body) =
            post("/plus?lng=en", envelope(json!({"a": 1})).to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "internal");
        assert_eq!(body["error"]["message"], "\"b\" is required");
        assert_eq!(body["meta"]["request"]["traceId"], "trace-42");
        assert_eq!(body["meta"]["serviceId"], "calc");
        assert_eq!(headers[X_TRACE_ID], "trace-42");
    }

    #[tokio::test]
    async fn unknown_payload_field_is_rejected() {
        let (status, _, body) =
            post("/plus?lng=en", envelope(json!({"a": 1, "b": 2, "c": 3})).to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "\"c\" is not allowed");
    }

    #[tokio::test]
    async fn accept_language_selects_catalog() {
        let request = Request::post("/plus")
            .header("accept-language", "es-PE,es;q=0.9")
            .body(Body::from(envelope(json!({"a": 1})).to_string()))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["message"], "\"b\" es requerido");
    }

    #[tokio::test]
    async fn unmatched_route_is_path_not_found() {
        let (status, headers, body) =
            post("/missing?lng=en", envelope(json!({})).to_string()).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "internal");
        assert_eq!(body["error"]["status"], 404);
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("missing"), "{message}");
        assert_eq!(body["meta"]["request"]["traceId"], "trace-42");
        assert_eq!(body["meta"]["serviceId"], "calc");
        assert_eq!(headers[X_STATUS_CODE], "404");
        assert_eq!(headers[X_TRACE_ID], "trace-42");
    }

    #[tokio::test]
    async fn unmatched_route_without_body_has_no_meta() {
        let request = Request::post("/missing").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[X_TRACE_ID], "unknown");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body.get("meta").is_none());
    }

    #[test]
    fn invalid_trace_id_header_falls_back_to_unknown() {
        let response = respond(400, "bad\ntrace", &json!({}));
        assert_eq!(response.headers()[X_TRACE_ID], "unknown");
        assert_eq!(response.headers()[X_STATUS_CODE], "400");
    }

    #[tokio::test]
    async fn wrong_method_is_path_not_found() {
        let request = Request::get("/plus").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn untranslated_business_error_is_returned_verbatim() {
        let (status, _, body) = post("/conflict", envelope(json!({})).to_string()).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["type"], "business");
        assert_eq!(body["error"]["status"], 409);
        assert_eq!(body["error"]["message"], "Order already shipped");
    }

    #[tokio::test]
    async fn unexpected_error_is_opaque() {
        let (status, _, body) = post("/explode?lng=en", envelope(json!({})).to_string()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["type"], "internal");
        assert_eq!(body["error"]["message"], "Internal server error");
        assert!(!body.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let (status, _, body) = post("/plus?lng=en", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "The request body is not valid JSON");
        assert!(body.get("meta").is_none());
    }
}
