//! Protocols layered on sockline connections.
//!
//! [`HeadProtocol`] decodes head-block requests and encodes responses, [`KeepAlive`] implements
//! the ping/pong contract with line frames. Both work over anything that is
//! [`Readable`](sockline_net::Readable) and [`Sendable`](sockline_net::Sendable).

#![forbid(unsafe_code)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod head;
mod keepalive;
mod protocol;
#[cfg(test)]
mod testing;

pub use head::{HeadDecodeError, Request, Response};
pub use keepalive::{Frame, KeepAlive};
pub use protocol::{HeadProtocol, ProtocolError};
