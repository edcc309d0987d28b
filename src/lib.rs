//! Distributed tracing middleware for HTTP clients and services.
//!
//! This crate wires a service into a tracing backend with three pieces:
//!
//! - [`export::install`] builds the OTLP export pipeline from a project
//!   id and a sampling ratio and registers it globally;
//! - [`trace::HttpLayer`] decorates a client or server [`Service`],
//!   creating one span per request named with the request URL and
//!   carrying the propagation headers;
//! - [`trace::RoundTripTrace`] breaks a single client round trip into
//!   per-phase child spans (connection acquisition, DNS, TCP, TLS
//!   handshake, request write, response wait and read).
//!
//! Server spans are decorated with the process [`Identity`] and with
//! caller-supplied [`Tags`], and can mark public endpoints and health
//! checks.
//!
//! Only [`export::install`] can fail; everything the middleware does at
//! request time absorbs its own errors, a broken tracing setup never
//! breaks the traffic it observes.
//!
//! [`Service`]: tower_service::Service

pub use self::{
    error::Error,
    export::{install, ExportConfig, Telemetry},
    identity::Identity,
    tags::{Tag, Tags},
};

pub mod error;
pub mod export;
pub mod identity;
pub mod tags;
pub mod trace;

mod util;
