//! Client connections created by a [`ConnectionFactory`](crate::ConnectionFactory).

use std::sync::{Arc, OnceLock};

use crate::{
    AddressFamily, Connection, ConnectionResource, DatagramConfig, Demultiplexer, Error,
    EventRegistry, FactoryConfig, NewPeerPolicy, PeerAddress, Readable, Sendable, Subscription,
    Transport, VirtualUdpConnection,
};

/// A stream client is a plain [`Connection`] that connects out.
pub type StreamClient = Connection;

/// A datagram client talking to a single server.
///
/// The client binds its own ephemeral socket and only accepts datagrams coming from the address it
/// connected to.
#[derive(Debug)]
pub struct DatagramClient {
    family: AddressFamily,
    demux: Demultiplexer,
    session: OnceLock<Arc<VirtualUdpConnection>>,
    read_events: EventRegistry<Vec<u8>>,
}

impl DatagramClient {
    /// Creates an idle client.
    pub fn new(family: AddressFamily, config: DatagramConfig) -> Self {
        Self {
            family,
            demux: Demultiplexer::new(
                Arc::new(ConnectionResource::new()),
                config,
                NewPeerPolicy::Ignore,
            ),
            session: OnceLock::new(),
            read_events: EventRegistry::new(),
        }
    }

    /// Binds the local socket and addresses all traffic to `address`.
    pub async fn connect(&self, address: &PeerAddress) -> Result<(), Error> {
        if address.family() != self.family {
            return Err(Error::AddressFamilyMismatch {
                address: address.clone(),
                expected: self.family,
            });
        }
        self.resource().connect(Transport::Udp, address).await?;
        let _ = self.session.set(self.demux.session(address));
        Ok(())
    }

    /// The shared local socket.
    pub fn resource(&self) -> &Arc<ConnectionResource> {
        self.demux.shared()
    }

    /// The view of the server, once connected.
    pub fn session(&self) -> Option<&Arc<VirtualUdpConnection>> {
        self.session.get()
    }

    /// Takes the next datagram from the server, routing anything pending first.
    pub fn read(&self) -> Result<Option<Vec<u8>>, Error> {
        self.demux.dispatch_pending()?;
        Ok(self.session().and_then(|session| session.read()))
    }

    /// Waits for datagrams to arrive, returning at once while some are still queued.
    pub async fn readable(&self) -> Result<(), Error> {
        if self.session().is_some_and(|session| session.buffer_len() > 0) {
            return Ok(());
        }
        self.demux.dispatch().await.map(drop)
    }

    /// Closes the session and the local socket.
    pub fn disconnect(&self) -> bool {
        if let Some(session) = self.session() {
            session.disconnect();
        }
        self.resource().disconnect()
    }
}

impl Readable for DatagramClient {
    async fn receive(&self) -> Result<Option<Vec<u8>>, Error> {
        let datagram = self.read()?;
        if let Some(datagram) = &datagram {
            self.read_events.emit(datagram.clone());
        }
        Ok(datagram)
    }
}

impl Sendable for DatagramClient {
    async fn send(&self, payload: &[u8]) -> Result<bool, Error> {
        match self.session() {
            Some(session) => session.send(payload).await,
            None if payload.is_empty() => Err(Error::EmptyPayload),
            None => Ok(false),
        }
    }
}

/// A client of either transport.
#[derive(Debug)]
pub enum Client {
    /// A stream client.
    Stream(StreamClient),

    /// A datagram client.
    Datagram(DatagramClient),
}

impl Client {
    /// Creates an idle client for `config`.
    pub fn new(config: &FactoryConfig) -> Self {
        match config.transport {
            Transport::Tcp => Self::Stream(Connection::new(config)),
            Transport::Udp => Self::Datagram(DatagramClient::new(config.address_family, config.datagram)),
        }
    }

    /// Connects to `address`.
    pub async fn connect(&self, address: &PeerAddress) -> Result<(), Error> {
        match self {
            Self::Stream(connection) => connection.connect(address).await,
            Self::Datagram(client) => client.connect(address).await,
        }
    }

    /// The underlying socket owner.
    pub fn resource(&self) -> &Arc<ConnectionResource> {
        match self {
            Self::Stream(connection) => connection.resource(),
            Self::Datagram(client) => client.resource(),
        }
    }

    /// Whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.resource().is_connected()
    }

    /// The local address of the client socket.
    pub fn local_address(&self) -> Option<PeerAddress> {
        self.resource().local_address()
    }

    /// Closes the client.
    pub fn disconnect(&self) -> bool {
        match self {
            Self::Stream(connection) => connection.disconnect(),
            Self::Datagram(client) => client.disconnect(),
        }
    }

    /// Attaches a listener for data returned by [`Readable::receive`].
    pub fn on_read(&self, listener: impl FnMut(&Vec<u8>) + Send + 'static) -> Subscription<Vec<u8>> {
        match self {
            Self::Stream(connection) => connection.on_read(listener),
            Self::Datagram(client) => client.read_events.subscribe(listener),
        }
    }

    /// Attaches a listener called once when the client disconnects.
    pub fn on_disconnect(&self, listener: impl FnMut(&()) + Send + 'static) -> Subscription<()> {
        self.resource().on_disconnect(listener)
    }

    /// Waits until data may be available for [`Readable::receive`].
    pub async fn readable(&self) -> Result<(), Error> {
        match self {
            Self::Stream(connection) => {
                let Some(handle) = connection.resource().handle() else {
                    return Ok(());
                };
                tokio::select! {
                    readable = handle.readable() => readable.map_err(|source| Error::Unknown {
                        operation: crate::Operation::Read,
                        source,
                    }),
                    () = connection.resource().closed() => Ok(()),
                }
            }
            Self::Datagram(client) => client.readable().await,
        }
    }
}

impl Readable for Client {
    async fn receive(&self) -> Result<Option<Vec<u8>>, Error> {
        match self {
            Self::Stream(connection) => connection.receive().await,
            Self::Datagram(client) => client.receive().await,
        }
    }
}

impl Sendable for Client {
    async fn send(&self, payload: &[u8]) -> Result<bool, Error> {
        match self {
            Self::Stream(connection) => connection.send(payload).await,
            Self::Datagram(client) => client.send(payload).await,
        }
    }
}
