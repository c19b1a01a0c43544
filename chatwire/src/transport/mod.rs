//! Transport layer: pluggable HTTP backend and the streaming client.

mod client;
mod http;

pub use client::{CancelRegistry, Registration, TransportClient, TransportEvent};
pub use http::{
    BufferedResponse, HttpTransport, ReqwestTransport, RequestDescriptor, StreamResponse,
    TransportRequest,
};
