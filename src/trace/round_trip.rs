//! Per-phase spans for a single HTTP round trip.

use std::sync::{Arc, Mutex};

use tracing::Span;

macro_rules! phase_span {
    ($parent:expr, $name:literal) => {
        tracing::debug_span!(
            parent: $parent,
            $name,
            "otel.status_code" = tracing::field::Empty,
        )
    };
}

/// Spans covering the phases of a single HTTP round trip.
///
/// Each phase of the round trip (connection acquisition, DNS lookup,
/// TCP connect, TLS handshake, request write, response wait and read)
/// gets its own [`Span`], nested under the span of the request that
/// started the round trip. One value tracks exactly one round trip and
/// must not be reused for the next attempt.
///
/// The connection layer driving the round trip reports each lifecycle
/// event exactly once and in order; a "done" event whose "start" never
/// fired (a reused connection skips DNS, TCP and TLS) is ignored.
/// Dropping the value closes every span still open, so an aborted
/// round trip cannot leak open phases.
#[derive(Debug)]
pub struct RoundTripTrace {
    parent: Span,
    get_conn: Option<Span>,
    tcp: Option<Span>,
    dns: Option<Span>,
    tls_handshake: Option<Span>,
    write_request_header: Option<Span>,
    write_request_body: Option<Span>,
    wait_first_byte: Option<Span>,
    read_response: Option<Span>,
}

impl RoundTripTrace {
    /// Track one round trip, nesting the phase spans under `parent`.
    pub fn new(parent: Span) -> Self {
        Self {
            parent,
            get_conn: None,
            tcp: None,
            dns: None,
            tls_handshake: None,
            write_request_header: None,
            write_request_body: None,
            wait_first_byte: None,
            read_response: None,
        }
    }

    /// A connection is being acquired from the pool or dialed.
    pub fn get_conn(&mut self) {
        self.get_conn = Some(phase_span!(&self.parent, "GetConn"));
    }

    /// A connection was acquired, the request headers are next.
    pub fn got_conn(&mut self) {
        end(&mut self.get_conn);
        self.write_request_header = Some(phase_span!(&self.parent, "WriteRequestHeader"));
    }

    /// A TCP connect started.
    pub fn connect_start(&mut self) {
        self.tcp = Some(phase_span!(&self.parent, "TCP"));
    }

    /// The TCP connect completed.
    pub fn connect_done(&mut self) {
        end(&mut self.tcp);
    }

    /// A DNS lookup started.
    pub fn dns_start(&mut self) {
        self.dns = Some(phase_span!(&self.parent, "DNS"));
    }

    /// The DNS lookup completed.
    pub fn dns_done(&mut self) {
        end(&mut self.dns);
    }

    /// A TLS handshake started.
    pub fn tls_handshake_start(&mut self) {
        self.tls_handshake = Some(phase_span!(&self.parent, "TLSHandshake"));
    }

    /// The TLS handshake completed.
    pub fn tls_handshake_done(&mut self) {
        end(&mut self.tls_handshake);
    }

    /// The request headers were written, the body is next.
    pub fn wrote_headers(&mut self) {
        end(&mut self.write_request_header);
        self.write_request_body = Some(phase_span!(&self.parent, "WriteRequestBody"));
    }

    /// The whole request was written, waiting for the server.
    pub fn wrote_request(&mut self) {
        end(&mut self.write_request_body);
        self.wait_first_byte = Some(phase_span!(&self.parent, "WaitFirstByte"));
    }

    /// The first byte of the response arrived.
    pub fn got_first_response_byte(&mut self) {
        end(&mut self.wait_first_byte);
        self.read_response = Some(phase_span!(&self.parent, "ReadResponse"));
    }

    /// The connection was returned to the pool.
    ///
    /// Returning a connection has no observable duration, the marker
    /// span only records the moment it happened.
    pub fn put_idle_conn(&mut self) {
        end(&mut self.read_response);
        let marker = phase_span!(&self.parent, "PutIdleConn");
        drop(marker);
    }

    /// Close every span still open, marking it as failed.
    ///
    /// Called on drop, so a round trip aborted by a timeout or by
    /// cancellation still closes all its phase spans.
    pub fn finish(&mut self) {
        for slot in [
            &mut self.get_conn,
            &mut self.tcp,
            &mut self.dns,
            &mut self.tls_handshake,
            &mut self.write_request_header,
            &mut self.write_request_body,
            &mut self.wait_first_byte,
            &mut self.read_response,
        ] {
            if let Some(span) = slot.take() {
                span.record("otel.status_code", "ERROR");
                drop(span);
            }
        }
    }

    #[cfg(test)]
    fn open_phases(&self) -> usize {
        [
            &self.get_conn,
            &self.tcp,
            &self.dns,
            &self.tls_handshake,
            &self.write_request_header,
            &self.write_request_body,
            &self.wait_first_byte,
            &self.read_response,
        ]
        .into_iter()
        .filter(|slot| slot.is_some())
        .count()
    }
}

impl Drop for RoundTripTrace {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Closing a span is dropping its handle.
fn end(slot: &mut Option<Span>) {
    if let Some(span) = slot.take() {
        drop(span);
    }
}

/// Cloneable handle to a [`RoundTripTrace`].
///
/// Stored in the extensions of the outgoing request so the connection
/// layer performing the round trip can report lifecycle events. Span
/// bookkeeping must never fail the request, a poisoned lock only skips
/// the event.
#[derive(Clone, Debug)]
pub struct RoundTripHandle(Arc<Mutex<RoundTripTrace>>);

impl RoundTripHandle {
    /// Track one round trip, nesting the phase spans under `parent`.
    pub fn new(parent: Span) -> Self {
        Self(Arc::new(Mutex::new(RoundTripTrace::new(parent))))
    }

    fn with(&self, event: impl FnOnce(&mut RoundTripTrace)) {
        match self.0.lock() {
            Ok(mut trace) => event(&mut trace),
            Err(_) => tracing::debug!("round trip trace is poisoned, event skipped"),
        }
    }

    /// See [`RoundTripTrace::get_conn`].
    pub fn get_conn(&self) {
        self.with(RoundTripTrace::get_conn);
    }

    /// See [`RoundTripTrace::got_conn`].
    pub fn got_conn(&self) {
        self.with(RoundTripTrace::got_conn);
    }

    /// See [`RoundTripTrace::connect_start`].
    pub fn connect_start(&self) {
        self.with(RoundTripTrace::connect_start);
    }

    /// See [`RoundTripTrace::connect_done`].
    pub fn connect_done(&self) {
        self.with(RoundTripTrace::connect_done);
    }

    /// See [`RoundTripTrace::dns_start`].
    pub fn dns_start(&self) {
        self.with(RoundTripTrace::dns_start);
    }

    /// See [`RoundTripTrace::dns_done`].
    pub fn dns_done(&self) {
        self.with(RoundTripTrace::dns_done);
    }

    /// See [`RoundTripTrace::tls_handshake_start`].
    pub fn tls_handshake_start(&self) {
        self.with(RoundTripTrace::tls_handshake_start);
    }

    /// See [`RoundTripTrace::tls_handshake_done`].
    pub fn tls_handshake_done(&self) {
        self.with(RoundTripTrace::tls_handshake_done);
    }

    /// See [`RoundTripTrace::wrote_headers`].
    pub fn wrote_headers(&self) {
        self.with(RoundTripTrace::wrote_headers);
    }

    /// See [`RoundTripTrace::wrote_request`].
    pub fn wrote_request(&self) {
        self.with(RoundTripTrace::wrote_request);
    }

    /// See [`RoundTripTrace::got_first_response_byte`].
    pub fn got_first_response_byte(&self) {
        self.with(RoundTripTrace::got_first_response_byte);
    }

    /// See [`RoundTripTrace::put_idle_conn`].
    pub fn put_idle_conn(&self) {
        self.with(RoundTripTrace::put_idle_conn);
    }

    /// See [`RoundTripTrace::finish`].
    pub fn finish(&self) {
        self.with(RoundTripTrace::finish);
    }
}
