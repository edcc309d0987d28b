//! Middleware that adds tracing to a [`Service`] that handles HTTP requests.
//!
//! [`Service`]: tower_service::Service

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use http::{Request, Response};
#[cfg(feature = "propagate")]
use opentelemetry_http::{HeaderExtractor, HeaderInjector};
use pin_project::pin_project;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{Level, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::{identity::Identity, tags::Tags, trace::round_trip::RoundTripHandle, util};

/// Predicate deciding whether an incoming request is a health check.
pub type HealthCheckPredicate = Arc<dyn Fn(&http::request::Parts) -> bool + Send + Sync>;

/// Describes the relationship between the [`Span`] and the service producing the span.
#[derive(Clone, Copy)]
enum SpanKind {
    /// The span describes a request sent to some remote service.
    Client,
    /// The span describes the server-side handling of a request.
    Server,
}

/// [`Layer`] that adds tracing to a [`Service`] that handles HTTP requests.
#[derive(Clone)]
pub struct HttpLayer {
    level: Level,
    kind: SpanKind,
    trace_round_trip: bool,
    public_endpoint: bool,
    health_check: Option<HealthCheckPredicate>,
    identity: Option<Identity>,
    tags: Tags,
}

impl HttpLayer {
    fn new(level: Level, kind: SpanKind) -> Self {
        Self {
            level,
            kind,
            trace_round_trip: false,
            public_endpoint: false,
            health_check: None,
            identity: None,
            tags: Tags::new(),
        }
    }

    /// [`Span`]s are constructed at the given level from server side.
    pub fn server(level: Level) -> Self {
        Self::new(level, SpanKind::Server)
    }

    /// [`Span`]s are constructed at the given level from client side.
    pub fn client(level: Level) -> Self {
        Self::new(level, SpanKind::Client)
    }

    /// Trace the phases of each outgoing round trip.
    ///
    /// A [`RoundTripHandle`] is stored in the extensions of every
    /// outgoing request, ready to be driven by the connection layer.
    /// Client side only.
    pub fn trace_round_trip(mut self, enabled: bool) -> Self {
        self.trace_round_trip = enabled;
        self
    }

    /// Treat incoming requests as arriving from an untrusted network.
    ///
    /// The remote trace context is recorded as a link instead of
    /// becoming the parent of the server span. Server side only.
    pub fn public_endpoint(mut self, public: bool) -> Self {
        self.public_endpoint = public;
        self
    }

    /// Mark server spans of requests matching the predicate as health
    /// checks. Server side only.
    pub fn health_check<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&http::request::Parts) -> bool + Send + Sync + 'static,
    {
        self.health_check = Some(Arc::new(predicate));
        self
    }

    /// Attach the process identity to every server span.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Attach a snapshot of the given tags to every server span.
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

impl<S> Layer<S> for HttpLayer {
    type Service = Http<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Http {
            inner,
            level: self.level,
            kind: self.kind,
            trace_round_trip: self.trace_round_trip,
            public_endpoint: self.public_endpoint,
            health_check: self.health_check.clone(),
            identity: self.identity.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Middleware that adds tracing to a [`Service`] that handles HTTP requests.
#[derive(Clone)]
pub struct Http<S> {
    inner: S,
    level: Level,
    kind: SpanKind,
    trace_round_trip: bool,
    public_endpoint: bool,
    health_check: Option<HealthCheckPredicate>,
    identity: Option<Identity>,
    tags: Tags,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Http<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: Display,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let (parts, body) = req.into_parts();
        let health_check = matches!(self.kind, SpanKind::Server)
            && self
                .health_check
                .as_ref()
                .is_some_and(|is_health_check| is_health_check(&parts));
        let mut req = Request::from_parts(parts, body);

        let span = self.make_request_span(&mut req, health_check);
        let inner = {
            let _enter = span.enter();
            self.inner.call(req)
        };

        ResponseFuture {
            inner,
            span,
            kind: self.kind,
        }
    }
}

impl<S> Http<S> {
    /// Creates a new [`Span`] for the given request.
    fn make_request_span<B>(&self, request: &mut Request<B>, health_check: bool) -> Span {
        macro_rules! make_span {
            ($level:expr) => {{
                use tracing::field::Empty;

                tracing::span!(
                    $level,
                    "HTTP",
                    "error.message" = Empty,
                    "health_check" = Empty,
                    "hostname" = Empty,
                    "http.request.method" = util::http_method(request.method()),
                    "http.response.status_code" = Empty,
                    "http.route" = Empty,
                    "network.protocol.name" = "http",
                    "network.protocol.version" = util::http_version(request.version()),
                    "otel.kind" = span_kind(self.kind),
                    "otel.name" = Empty,
                    "otel.status_code" = Empty,
                    "project" = Empty,
                    "url.full" = Empty,
                    "url.path" = request.uri().path(),
                    "url.query" = Empty,
                    "url.scheme" = Empty,
                )
            }};
        }

        let span = match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        };

        // the exported span is named with the URL of the request
        span.record("otel.name", tracing::field::display(request.uri()));

        if let Some(query) = request.uri().query() {
            span.record("url.query", query);
        }

        match self.kind {
            SpanKind::Client => {
                span.record("url.full", tracing::field::display(request.uri()));

                if let Some(url_scheme) = request.uri().scheme_str() {
                    span.record("url.scheme", url_scheme);
                }

                #[cfg(feature = "propagate")]
                {
                    let context = span.context();
                    opentelemetry::global::get_text_map_propagator(|injector| {
                        injector
                            .inject_context(&context, &mut HeaderInjector(request.headers_mut()));
                    });
                }

                if self.trace_round_trip {
                    request
                        .extensions_mut()
                        .insert(RoundTripHandle::new(span.clone()));
                }
            }
            SpanKind::Server => {
                if let Some(http_route) = util::http_route(request) {
                    span.record("http.route", http_route);
                }

                if let Some(url_scheme) = util::http_url_scheme(request) {
                    span.record("url.scheme", url_scheme);
                }

                if let Some(identity) = &self.identity {
                    span.record("project", identity.project_id());
                    span.record("hostname", identity.hostname());
                }

                for (key, value) in self.tags.snapshot().iter() {
                    span.set_attribute(key.clone(), value.clone());
                }

                if health_check {
                    span.record("health_check", true);
                }

                #[cfg(feature = "propagate")]
                {
                    let remote = opentelemetry::global::get_text_map_propagator(|extractor| {
                        extractor.extract(&HeaderExtractor(request.headers()))
                    });
                    if self.public_endpoint {
                        use opentelemetry::trace::TraceContextExt;

                        let remote = remote.span().span_context().clone();
                        if remote.is_valid() {
                            span.add_link(remote);
                        }
                    } else {
                        span.set_parent(remote);
                    }
                }
            }
        }

        span
    }
}

/// Response future for [`Http`].
#[pin_project]
pub struct ResponseFuture<F> {
    #[pin]
    inner: F,
    span: Span,
    kind: SpanKind,
}

impl<F, ResBody, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
    E: Display,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _enter = this.span.enter();

        match ready!(this.inner.poll(cx)) {
            Ok(response) => {
                record_response(this.span, *this.kind, &response);
                Poll::Ready(Ok(response))
            }
            Err(err) => {
                record_error(this.span, &err);
                Poll::Ready(Err(err))
            }
        }
    }
}

/// String representation of span kind
fn span_kind(kind: SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "client",
        SpanKind::Server => "server",
    }
}

/// Records fields associated to the response.
fn record_response<B>(span: &Span, kind: SpanKind, response: &Response<B>) {
    span.record(
        "http.response.status_code",
        response.status().as_u16() as i64,
    );

    for (header_name, header_value) in response.headers().iter() {
        if let Ok(attribute_value) = header_value.to_str() {
            let attribute_name = format!("http.response.header.{}", header_name);
            span.set_attribute(attribute_name, attribute_value.to_owned());
        }
    }

    if let SpanKind::Client = kind {
        if response.status().is_client_error() {
            span.record("otel.status_code", "ERROR");
        }
    }
    if response.status().is_server_error() {
        span.record("otel.status_code", "ERROR");
    }
}

/// Records the error message.
fn record_error<E: Display>(span: &Span, err: &E) {
    span.record("otel.status_code", "ERROR");
    span.record("error.message", err.to_string());
}
