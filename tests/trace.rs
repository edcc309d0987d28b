use std::{
    collections::HashMap,
    convert::Infallible,
    fmt,
    sync::{Arc, Mutex},
};

use http::{HeaderMap, Request, Response};
use tower::{Layer as _, ServiceExt};
use tower_cloudtrace::{
    trace::{HttpLayer, RoundTripTrace},
    Identity, Tags,
};
use tracing::{
    field::{Field, Visit},
    span::{Attributes, Id, Record},
    Level, Span, Subscriber,
};
use tracing_subscriber::layer::{Context, SubscriberExt};

const PHASES: [&str; 9] = [
    "GetConn",
    "DNS",
    "TCP",
    "TLSHandshake",
    "WriteRequestHeader",
    "WriteRequestBody",
    "WaitFirstByte",
    "ReadResponse",
    "PutIdleConn",
];

/// Subscriber layer recording every span seen: name, parent, fields
/// and how many times it was closed.
#[derive(Clone, Default)]
struct Recorder {
    spans: Arc<Mutex<Vec<SpanRecord>>>,
}

#[derive(Clone, Debug)]
struct SpanRecord {
    id: u64,
    name: &'static str,
    parent: Option<u64>,
    fields: HashMap<String, String>,
    closed: usize,
}

impl Recorder {
    fn opened(&self, name: &str) -> usize {
        let spans = self.spans.lock().unwrap();
        spans.iter().filter(|span| span.name == name).count()
    }

    fn closed(&self, name: &str) -> usize {
        let spans = self.spans.lock().unwrap();
        spans
            .iter()
            .filter(|span| span.name == name)
            .map(|span| span.closed)
            .sum()
    }

    fn field(&self, name: &str, field: &str) -> Option<String> {
        let spans = self.spans.lock().unwrap();
        spans
            .iter()
            .rev()
            .find(|span| span.name == name)
            .and_then(|span| span.fields.get(field).cloned())
    }

    fn parent_of(&self, name: &str) -> Option<&'static str> {
        let spans = self.spans.lock().unwrap();
        let parent = spans.iter().rev().find(|span| span.name == name)?.parent?;
        spans
            .iter()
            .rev()
            .find(|span| span.id == parent)
            .map(|span| span.name)
    }
}

impl<S: Subscriber> tracing_subscriber::Layer<S> for Recorder {
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));

        let mut spans = self.spans.lock().unwrap();
        spans.push(SpanRecord {
            id: id.into_u64(),
            name: attrs.metadata().name(),
            parent: attrs.parent().map(Id::into_u64),
            fields,
            closed: 0,
        });
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        let mut spans = self.spans.lock().unwrap();
        // span ids are reused once closed, the most recent entry wins
        if let Some(span) = spans.iter_mut().rev().find(|span| span.id == id.into_u64()) {
            values.record(&mut FieldVisitor(&mut span.fields));
        }
    }

    fn on_close(&self, id: Id, _ctx: Context<'_, S>) {
        let mut spans = self.spans.lock().unwrap();
        if let Some(span) = spans.iter_mut().rev().find(|span| span.id == id.into_u64()) {
            span.closed += 1;
        }
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_owned(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_owned(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_owned(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{:?}", value));
    }
}

fn recorded() -> (Recorder, tracing::subscriber::DefaultGuard) {
    let recorder = Recorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (recorder, guard)
}

fn ok_service(
) -> impl tower::Service<Request<()>, Response = Response<()>, Error = Infallible> + Clone {
    tower::service_fn(|_req: Request<()>| async { Ok(Response::new(())) })
}

#[test]
fn round_trip_phases_open_and_close_exactly_once() {
    let (recorder, _guard) = recorded();

    let parent = tracing::info_span!("request");
    let mut trace = RoundTripTrace::new(parent);
    trace.get_conn();
    trace.dns_start();
    trace.dns_done();
    trace.connect_start();
    trace.connect_done();
    trace.tls_handshake_start();
    trace.tls_handshake_done();
    trace.got_conn();
    trace.wrote_headers();
    trace.wrote_request();
    trace.got_first_response_byte();
    trace.put_idle_conn();
    drop(trace);

    for phase in PHASES {
        assert_eq!(recorder.opened(phase), 1, "{phase} should open once");
        assert_eq!(recorder.closed(phase), 1, "{phase} should close once");
    }
}

#[test]
fn round_trip_phases_nest_under_the_request_span() {
    let (recorder, _guard) = recorded();

    let parent = tracing::info_span!("request");
    let mut trace = RoundTripTrace::new(parent);
    trace.get_conn();
    trace.got_conn();
    drop(trace);

    assert_eq!(recorder.parent_of("GetConn"), Some("request"));
    assert_eq!(recorder.parent_of("WriteRequestHeader"), Some("request"));
}

#[test]
fn reused_connection_produces_no_dial_spans() {
    let (recorder, _guard) = recorded();

    let mut trace = RoundTripTrace::new(Span::none());
    trace.get_conn();
    trace.got_conn();
    trace.wrote_headers();
    trace.wrote_request();
    trace.got_first_response_byte();
    trace.put_idle_conn();

    // done events without their start counterpart must not fire either
    trace.dns_done();
    trace.connect_done();
    trace.tls_handshake_done();
    drop(trace);

    for phase in ["DNS", "TCP", "TLSHandshake"] {
        assert_eq!(recorder.opened(phase), 0, "{phase} should not open");
        assert_eq!(recorder.closed(phase), 0, "{phase} should not close");
    }
}

#[test]
fn aborted_round_trip_closes_open_phases_with_an_error() {
    let (recorder, _guard) = recorded();

    let mut trace = RoundTripTrace::new(Span::none());
    trace.get_conn();
    trace.got_conn();
    // the request is canceled while writing the headers
    drop(trace);

    assert_eq!(recorder.closed("WriteRequestHeader"), 1);
    assert_eq!(
        recorder
            .field("WriteRequestHeader", "otel.status_code")
            .as_deref(),
        Some("ERROR")
    );

    // the completed phase keeps its clean status
    assert_eq!(recorder.field("GetConn", "otel.status_code"), None);
}

#[tokio::test]
async fn client_span_is_named_with_the_request_url() {
    let (recorder, _guard) = recorded();

    let service = HttpLayer::client(Level::INFO).layer(ok_service());
    let request = Request::get("http://example.com/path").body(()).unwrap();
    service.oneshot(request).await.unwrap();

    assert_eq!(
        recorder.field("HTTP", "otel.name").as_deref(),
        Some("http://example.com/path")
    );
    assert_eq!(
        recorder.field("HTTP", "url.full").as_deref(),
        Some("http://example.com/path")
    );
    assert_eq!(recorder.field("HTTP", "otel.kind").as_deref(), Some("client"));
}

#[tokio::test]
async fn client_requests_carry_the_propagation_header() {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::{
        propagation::TraceContextPropagator,
        trace::{InMemorySpanExporter, SdkTracerProvider},
    };

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(InMemorySpanExporter::default())
        .build();
    let telemetry = tracing_opentelemetry::layer().with_tracer(provider.tracer("test"));

    let subscriber = tracing_subscriber::registry().with(telemetry);
    let _guard = tracing::subscriber::set_default(subscriber);

    let headers: Arc<Mutex<Option<HeaderMap>>> = Arc::default();
    let captured = Arc::clone(&headers);
    let service = tower::service_fn(move |req: Request<()>| {
        let captured = Arc::clone(&captured);
        async move {
            *captured.lock().unwrap() = Some(req.headers().clone());
            Ok::<_, Infallible>(Response::new(()))
        }
    });
    let service = HttpLayer::client(Level::INFO).layer(service);

    let request = Request::get("http://example.com/path").body(()).unwrap();
    service.oneshot(request).await.unwrap();

    let headers = headers.lock().unwrap().take().unwrap();
    assert!(headers.contains_key("traceparent"));
}

#[tokio::test]
async fn client_round_trip_handle_is_available_to_the_connection_layer() {
    use tower_cloudtrace::trace::RoundTripHandle;

    let (recorder, _guard) = recorded();

    let service = tower::service_fn(|req: Request<()>| async move {
        // the connection layer picks the handle up from the extensions
        let handle = req.extensions().get::<RoundTripHandle>().unwrap().clone();
        handle.get_conn();
        handle.got_conn();
        handle.wrote_headers();
        handle.wrote_request();
        handle.got_first_response_byte();
        handle.put_idle_conn();
        Ok::<_, Infallible>(Response::new(()))
    });
    let service = HttpLayer::client(Level::INFO)
        .trace_round_trip(true)
        .layer(service);

    let request = Request::get("http://example.com/path").body(()).unwrap();
    service.oneshot(request).await.unwrap();

    for phase in ["GetConn", "WriteRequestHeader", "PutIdleConn"] {
        assert_eq!(recorder.opened(phase), 1, "{phase} should open once");
        assert_eq!(recorder.closed(phase), 1, "{phase} should close once");
    }
    assert_eq!(recorder.parent_of("GetConn"), Some("HTTP"));
}

#[tokio::test]
async fn server_span_marks_health_checks() {
    let (recorder, _guard) = recorded();

    let service = HttpLayer::server(Level::INFO)
        .health_check(|parts| parts.uri.path() == "/healthz")
        .layer(ok_service());

    let request = Request::get("/healthz").body(()).unwrap();
    service.oneshot(request).await.unwrap();

    assert_eq!(
        recorder.field("HTTP", "health_check").as_deref(),
        Some("true")
    );
}

#[tokio::test]
async fn server_span_is_not_marked_without_a_matching_predicate() {
    let (recorder, _guard) = recorded();

    let service = HttpLayer::server(Level::INFO)
        .health_check(|parts| parts.uri.path() == "/healthz")
        .layer(ok_service());

    let request = Request::get("/users").body(()).unwrap();
    service.oneshot(request).await.unwrap();

    assert_eq!(recorder.field("HTTP", "health_check"), None);

    let (recorder, _guard) = recorded();

    let service = HttpLayer::server(Level::INFO).layer(ok_service());
    let request = Request::get("/healthz").body(()).unwrap();
    service.oneshot(request).await.unwrap();

    assert_eq!(recorder.field("HTTP", "health_check"), None);
}

#[tokio::test]
async fn server_span_carries_identity_attributes() {
    let (recorder, _guard) = recorded();

    let tags = Tags::new();
    tags.merge([("team".to_owned(), "infra".to_owned())]);

    let service = HttpLayer::server(Level::INFO)
        .with_identity(Identity::new("host-1", "my-project"))
        .with_tags(tags)
        .layer(ok_service());

    let request = Request::get("/users").body(()).unwrap();
    service.oneshot(request).await.unwrap();

    assert_eq!(
        recorder.field("HTTP", "project").as_deref(),
        Some("my-project")
    );
    assert_eq!(recorder.field("HTTP", "hostname").as_deref(), Some("host-1"));
    assert_eq!(recorder.field("HTTP", "otel.kind").as_deref(), Some("server"));
}

#[tokio::test]
async fn failed_responses_mark_the_span_as_error() {
    let (recorder, _guard) = recorded();

    let service = tower::service_fn(|_req: Request<()>| async {
        let response = Response::builder().status(500).body(()).unwrap();
        Ok::<_, Infallible>(response)
    });
    let service = HttpLayer::server(Level::INFO).layer(service);

    let request = Request::get("/users").body(()).unwrap();
    service.oneshot(request).await.unwrap();

    assert_eq!(
        recorder
            .field("HTTP", "http.response.status_code")
            .as_deref(),
        Some("500")
    );
    assert_eq!(
        recorder.field("HTTP", "otel.status_code").as_deref(),
        Some("ERROR")
    );
}
