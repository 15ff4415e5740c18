//! Servers created by a [`ConnectionFactory`](crate::ConnectionFactory).
//!
//! Servers are polled: [`Server::listen`] takes in new peers and [`Server::read`] drains the
//! existing ones, firing the connect and read listeners along the way.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    Connection, ConnectionResource, Demultiplexer, Error, EventRegistry, FactoryConfig,
    NewPeerPolicy, PeerAddress, Readable, Sendable, Subscription, Transport, VirtualUdpConnection,
};

fn check_family(config: &FactoryConfig, address: &PeerAddress) -> Result<(), Error> {
    if address.family() == config.address_family {
        Ok(())
    } else {
        Err(Error::AddressFamilyMismatch {
            address: address.clone(),
            expected: config.address_family,
        })
    }
}

/// A peer connected to a server.
#[derive(Debug, Clone)]
pub enum Peer {
    /// An accepted stream connection.
    Stream(Arc<Connection>),

    /// A virtual connection on the server's datagram socket.
    Datagram(Arc<VirtualUdpConnection>),
}

impl Peer {
    /// The remote address.
    pub fn address(&self) -> Option<PeerAddress> {
        match self {
            Self::Stream(connection) => connection.peer_address(),
            Self::Datagram(connection) => Some(connection.peer_address().clone()),
        }
    }

    /// Whether the peer is still usable.
    pub fn is_connected(&self) -> bool {
        match self {
            Self::Stream(connection) => connection.is_connected(),
            Self::Datagram(connection) => connection.is_connected(),
        }
    }

    /// Closes the connection to this peer.
    pub fn disconnect(&self) -> bool {
        match self {
            Self::Stream(connection) => connection.disconnect(),
            Self::Datagram(connection) => connection.disconnect(),
        }
    }

    /// Attaches a listener for data received from this peer.
    pub fn on_read(&self, listener: impl FnMut(&Vec<u8>) + Send + 'static) -> Subscription<Vec<u8>> {
        match self {
            Self::Stream(connection) => connection.on_read(listener),
            Self::Datagram(connection) => connection.on_read(listener),
        }
    }

    /// Attaches a listener called once when this peer disconnects.
    pub fn on_disconnect(&self, listener: impl FnMut(&()) + Send + 'static) -> Subscription<()> {
        match self {
            Self::Stream(connection) => connection.on_disconnect(listener),
            Self::Datagram(connection) => connection.on_disconnect(listener),
        }
    }
}

impl Readable for Peer {
    async fn receive(&self) -> Result<Option<Vec<u8>>, Error> {
        match self {
            Self::Stream(connection) => connection.receive().await,
            Self::Datagram(connection) => connection.receive().await,
        }
    }
}

impl Sendable for Peer {
    async fn send(&self, payload: &[u8]) -> Result<bool, Error> {
        match self {
            Self::Stream(connection) => connection.send(payload).await,
            Self::Datagram(connection) => connection.send(payload).await,
        }
    }
}

/// A listening stream socket and its accepted connections.
#[derive(Debug)]
pub struct StreamServer {
    config: FactoryConfig,
    listener: Arc<ConnectionResource>,
    peers: Mutex<BTreeMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    connect_events: EventRegistry<Peer>,
}

impl StreamServer {
    /// Creates an unbound server.
    pub fn new(config: &FactoryConfig) -> Self {
        Self {
            config: *config,
            listener: Arc::new(ConnectionResource::new()),
            peers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            connect_events: EventRegistry::new(),
        }
    }

    fn peer_table(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<Connection>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds and starts listening at `address`, returning the bound address.
    pub async fn bind(&self, address: &PeerAddress) -> Result<PeerAddress, Error> {
        check_family(&self.config, address)?;
        self.listener.bind(Transport::Tcp, address).await
    }

    fn admit(&self, resource: Arc<ConnectionResource>) -> Peer {
        let connection = Arc::new(Connection::with_resource(resource, &self.config));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peer_table().insert(id, connection.clone());
        let peer = Peer::Stream(connection);
        self.connect_events.emit(peer.clone());
        peer
    }

    /// Accepts every pending connection without waiting.
    pub fn listen(&self) -> Result<Vec<Peer>, Error> {
        let mut accepted = Vec::new();
        loop {
            let resource = Arc::new(ConnectionResource::new());
            if resource.try_accept(&self.listener)?.is_none() {
                return Ok(accepted);
            }
            accepted.push(self.admit(resource));
        }
    }

    /// Waits for the next connection.
    pub async fn accept(&self) -> Result<Peer, Error> {
        let resource = Arc::new(ConnectionResource::new());
        resource.accept(&self.listener).await?;
        Ok(self.admit(resource))
    }

    /// Takes available data from every peer and drops peers that disconnected.
    ///
    /// A peer failing with an unknown error is disconnected without affecting the others.
    pub async fn read(&self) -> Result<(), Error> {
        let peers: Vec<_> = self.peer_table().values().cloned().collect();
        for connection in peers {
            if let Err(error) = connection.receive().await {
                tracing::warn!(peer = ?connection.peer_address(), ?error, "read failed, dropping peer");
                connection.disconnect();
            }
        }
        self.peer_table().retain(|_, connection| connection.is_connected());
        Ok(())
    }

    /// The connected peers, in accept order.
    pub fn peers(&self) -> Vec<Peer> {
        self.peer_table()
            .values()
            .filter(|connection| connection.is_connected())
            .cloned()
            .map(Peer::Stream)
            .collect()
    }

    /// Closes the listener and every peer.
    pub fn disconnect(&self) {
        let peers = std::mem::take(&mut *self.peer_table());
        for connection in peers.into_values() {
            connection.disconnect();
        }
        self.listener.disconnect();
    }
}

/// A datagram socket shared by every peer.
#[derive(Debug)]
pub struct DatagramServer {
    config: FactoryConfig,
    demux: Demultiplexer,
    connect_events: EventRegistry<Peer>,
}

impl DatagramServer {
    /// Creates an unbound server.
    pub fn new(config: &FactoryConfig) -> Self {
        Self {
            config: *config,
            demux: Demultiplexer::new(
                Arc::new(ConnectionResource::new()),
                config.datagram,
                NewPeerPolicy::Accept,
            ),
            connect_events: EventRegistry::new(),
        }
    }

    /// Binds the shared socket at `address`, returning the bound address.
    pub async fn bind(&self, address: &PeerAddress) -> Result<PeerAddress, Error> {
        check_family(&self.config, address)?;
        self.demux.shared().bind(Transport::Udp, address).await
    }

    /// The demultiplexer routing datagrams to peers.
    pub fn demultiplexer(&self) -> &Demultiplexer {
        &self.demux
    }

    fn admit(&self, sessions: Vec<Arc<VirtualUdpConnection>>) -> Vec<Peer> {
        sessions
            .into_iter()
            .map(|session| {
                let peer = Peer::Datagram(session);
                self.connect_events.emit(peer.clone());
                peer
            })
            .collect()
    }

    /// Routes pending datagrams, returning peers seen for the first time.
    pub fn listen(&self) -> Result<Vec<Peer>, Error> {
        let opened = self.demux.dispatch_pending()?;
        Ok(self.admit(opened))
    }

    /// Waits for datagrams, returning peers seen for the first time.
    pub async fn accept(&self) -> Result<Vec<Peer>, Error> {
        let opened = self.demux.dispatch().await?;
        Ok(self.admit(opened))
    }

    /// Delivers every queued datagram to the read listeners of its peer.
    pub async fn read(&self) -> Result<(), Error> {
        for session in self.demux.peers() {
            while session.receive().await?.is_some() {}
        }
        Ok(())
    }

    /// The open virtual connections, ordered by address.
    pub fn peers(&self) -> Vec<Peer> {
        self.demux
            .peers()
            .into_iter()
            .filter(|session| session.is_connected())
            .map(Peer::Datagram)
            .collect()
    }

    /// Closes every session and the shared socket.
    pub fn disconnect(&self) {
        self.demux.clear();
        self.demux.shared().disconnect();
    }
}

/// A server of either transport.
#[derive(Debug)]
pub enum Server {
    /// A stream server.
    Stream(StreamServer),

    /// A datagram server.
    Datagram(DatagramServer),
}

impl Server {
    /// Creates an unbound server for `config`.
    pub fn new(config: &FactoryConfig) -> Self {
        match config.transport {
            Transport::Tcp => Self::Stream(StreamServer::new(config)),
            Transport::Udp => Self::Datagram(DatagramServer::new(config)),
        }
    }

    /// Binds the server socket at `address`, returning the bound address.
    pub async fn bind(&self, address: &PeerAddress) -> Result<PeerAddress, Error> {
        match self {
            Self::Stream(server) => server.bind(address).await,
            Self::Datagram(server) => server.bind(address).await,
        }
    }

    /// Takes in pending peers without waiting and fires the connect listeners for them.
    pub fn listen(&self) -> Result<Vec<Peer>, Error> {
        match self {
            Self::Stream(server) => server.listen(),
            Self::Datagram(server) => server.listen(),
        }
    }

    /// Polls every peer for data, firing its read listeners.
    pub async fn read(&self) -> Result<(), Error> {
        match self {
            Self::Stream(server) => server.read().await,
            Self::Datagram(server) => server.read().await,
        }
    }

    /// The connected peers.
    pub fn peers(&self) -> Vec<Peer> {
        match self {
            Self::Stream(server) => server.peers(),
            Self::Datagram(server) => server.peers(),
        }
    }

    /// The socket the server listens on.
    pub fn resource(&self) -> &Arc<ConnectionResource> {
        match self {
            Self::Stream(server) => &server.listener,
            Self::Datagram(server) => server.demux.shared(),
        }
    }

    /// The bound address.
    pub fn local_address(&self) -> Option<PeerAddress> {
        self.resource().local_address()
    }

    /// Closes the server and all its peers.
    pub fn disconnect(&self) {
        match self {
            Self::Stream(server) => server.disconnect(),
            Self::Datagram(server) => server.disconnect(),
        }
    }

    /// Attaches a listener called for every new peer.
    pub fn on_connect(&self, listener: impl FnMut(&Peer) + Send + 'static) -> Subscription<Peer> {
        match self {
            Self::Stream(server) => server.connect_events.subscribe(listener),
            Self::Datagram(server) => server.connect_events.subscribe(listener),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::StreamServer;
    use crate::handle::scripted::ScriptedSocket;
    use crate::{ConnectionResource, FactoryConfig, Readable};

    #[tokio::test]
    async fn failing_peer_does_not_stop_the_others() {
        let server = StreamServer::new(&FactoryConfig::default());
        let failing = Arc::new(
            ScriptedSocket::new().read(Err(io::Error::from_raw_os_error(libc::EBADMSG))),
        );
        let healthy = Arc::new(ScriptedSocket::new().read(Ok(b"hi".to_vec())));

        let first = server.admit(Arc::new(ConnectionResource::scripted(failing)));
        let second = server.admit(Arc::new(ConnectionResource::scripted(healthy.clone())));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        second.on_read(move |bytes| {
            let _ = tx.send(bytes.clone());
        });

        server.read().await.unwrap();

        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert_eq!(healthy.read_attempts(), 1);
        assert_eq!(rx.recv().await, Some(b"hi".to_vec()));
        assert_eq!(server.peers().len(), 1);
    }

    #[tokio::test]
    async fn peers_that_closed_are_pruned() {
        let server = StreamServer::new(&FactoryConfig::default());
        let closing = Arc::new(ScriptedSocket::new().read(Ok(Vec::new())));
        let peer = server.admit(Arc::new(ConnectionResource::scripted(closing)));

        server.read().await.unwrap();

        assert!(!peer.is_connected());
        assert!(server.peers().is_empty());
        assert_eq!(peer.receive().await.unwrap(), None);
    }
}
