//! Capabilities shared by connections, virtual connections and protocol adapters.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::{Error, Subscription};

/// Something that can hand out the next chunk of received application data.
#[expect(async_fn_in_trait)]
pub trait Readable {
    /// Takes the next available data and notifies read listeners.
    ///
    /// `Ok(None)` when nothing was available or the read failed.
    async fn receive(&self) -> Result<Option<Vec<u8>>, Error>;
}

/// Something that can send application data.
#[expect(async_fn_in_trait)]
pub trait Sendable {
    /// Sends `payload`, returning whether it was delivered to the OS in full.
    async fn send(&self, payload: &[u8]) -> Result<bool, Error>;
}

/// A liveness probe payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PingPacket {
    /// Sequence number echoed back by the peer.
    pub sequence: u64,
}

impl Display for PingPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.sequence)
    }
}

/// Liveness probing: send pings and get told about matching pongs.
#[expect(async_fn_in_trait)]
pub trait PingCapable {
    /// Sends `packet` to the peer.
    async fn ping(&self, packet: PingPacket) -> Result<bool, Error>;

    /// Attaches a listener called with every packet the peer echoed back.
    fn pong(&self, listener: impl FnMut(&PingPacket) + Send + 'static) -> Subscription<PingPacket>;
}

impl<T: Readable> Readable for Arc<T> {
    async fn receive(&self) -> Result<Option<Vec<u8>>, Error> {
        T::receive(self).await
    }
}

impl<T: Sendable> Sendable for Arc<T> {
    async fn send(&self, payload: &[u8]) -> Result<bool, Error> {
        T::send(self, payload).await
    }
}
