//! Middleware that adds tracing to a [`Service`].
//!
//! [`Service`]: tower_service::Service

#[doc(inline)]
pub use self::{
    http::{Http, HttpLayer},
    round_trip::{RoundTripHandle, RoundTripTrace},
};

pub mod http;
pub mod round_trip;
