//! Stream connections.

use std::sync::Arc;

use crate::{
    AddressFamily, ConnectionResource, Error, EventRegistry, FactoryConfig, PeerAddress, Readable,
    Sendable, SocketChannel, State, Subscription, Transport,
};

/// One stream connection, either dialled by a client or accepted by a server.
#[derive(Debug)]
pub struct Connection {
    channel: SocketChannel,
    family: AddressFamily,
    read_buffer_size: usize,
    read_events: EventRegistry<Vec<u8>>,
}

impl Connection {
    /// Creates an idle connection for `config`.
    pub fn new(config: &FactoryConfig) -> Self {
        Self::with_resource(Arc::new(ConnectionResource::new()), config)
    }

    /// Wraps an existing resource, usually one that has just accepted a peer.
    pub fn with_resource(resource: Arc<ConnectionResource>, config: &FactoryConfig) -> Self {
        Self {
            channel: SocketChannel::new(resource, config.retry),
            family: config.address_family,
            read_buffer_size: config.read_buffer_size,
            read_events: EventRegistry::new(),
        }
    }

    /// Connects to `address`.
    pub async fn connect(&self, address: &PeerAddress) -> Result<(), Error> {
        if address.family() != self.family {
            return Err(Error::AddressFamilyMismatch {
                address: address.clone(),
                expected: self.family,
            });
        }
        self.resource().connect(Transport::Tcp, address).await
    }

    /// The underlying resource.
    pub fn resource(&self) -> &Arc<ConnectionResource> {
        self.channel.resource()
    }

    /// The I/O engine bound to this connection.
    pub fn channel(&self) -> &SocketChannel {
        &self.channel
    }

    /// The remote address.
    pub fn peer_address(&self) -> Option<PeerAddress> {
        self.resource().peer_address()
    }

    /// The local address.
    pub fn local_address(&self) -> Option<PeerAddress> {
        self.resource().local_address()
    }

    /// See [`SocketChannel::read`].
    pub async fn read(&self, max_length: usize, exact: bool) -> Result<Option<Vec<u8>>, Error> {
        self.channel.read(max_length, exact).await
    }

    /// Lifecycle state of the underlying resource.
    pub fn state(&self) -> State {
        self.resource().state()
    }

    /// Whether the connection is usable.
    pub fn is_connected(&self) -> bool {
        self.resource().is_connected()
    }

    /// Closes the connection, see [`ConnectionResource::disconnect`].
    pub fn disconnect(&self) -> bool {
        self.resource().disconnect()
    }

    /// Attaches a listener for data returned by [`Readable::receive`].
    pub fn on_read(&self, listener: impl FnMut(&Vec<u8>) + Send + 'static) -> Subscription<Vec<u8>> {
        self.read_events.subscribe(listener)
    }

    /// Attaches a listener called once when the connection closes.
    pub fn on_disconnect(&self, listener: impl FnMut(&()) + Send + 'static) -> Subscription<()> {
        self.resource().on_disconnect(listener)
    }
}

impl Readable for Connection {
    async fn receive(&self) -> Result<Option<Vec<u8>>, Error> {
        match self.channel.read(self.read_buffer_size, false).await? {
            Some(data) if !data.is_empty() => {
                self.read_events.emit(data.clone());
                Ok(Some(data))
            }
            _ => Ok(None),
        }
    }
}

impl Sendable for Connection {
    async fn send(&self, payload: &[u8]) -> Result<bool, Error> {
        self.channel.send(payload).await
    }
}
