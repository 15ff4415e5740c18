//! Per-peer views of a shared datagram socket.
//!
//! A datagram server owns one socket for all peers. A [`VirtualUdpConnection`] gives a single peer
//! the look of a dedicated connection: its own inbound queue, sends addressed to that peer, and a
//! disconnect that only closes the view. The shared socket is only referenced weakly, it stays
//! owned by whoever bound it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::{
    Classification, ClassificationTable, ConnectionResource, DatagramConfig, Error, EventRegistry,
    Operation, OverflowPolicy, PeerAddress, Readable, Sendable, Subscription,
};

/// A peer behind a shared datagram socket.
#[derive(Debug)]
pub struct VirtualUdpConnection {
    shared: Weak<ConnectionResource>,
    peer: PeerAddress,
    queue: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
    closed: AtomicBool,
    read_events: EventRegistry<Vec<u8>>,
    disconnect_events: EventRegistry<()>,
}

impl VirtualUdpConnection {
    /// Creates the view of `peer` on `shared`.
    pub fn new(shared: &Arc<ConnectionResource>, peer: PeerAddress, config: &DatagramConfig) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            peer,
            queue: Mutex::new(VecDeque::new()),
            capacity: config.queue_capacity,
            overflow: config.overflow,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            read_events: EventRegistry::new(),
            disconnect_events: EventRegistry::new(),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The peer this view talks to.
    pub fn peer_address(&self) -> &PeerAddress {
        &self.peer
    }

    /// Takes the oldest queued datagram, if any.
    pub fn read(&self) -> Option<Vec<u8>> {
        self.queue().pop_front()
    }

    /// Queues a datagram received from the peer.
    ///
    /// Returns `false` if a datagram was lost to overflow (the evicted one or the new one,
    /// depending on the [`OverflowPolicy`]) or the view is closed.
    pub fn add_to_buffer(&self, datagram: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let mut queue = self.queue();
        if queue.len() < self.capacity {
            queue.push_back(datagram);
            return true;
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(peer = %self.peer, policy = ?self.overflow, "datagram queue full");
        if self.overflow == OverflowPolicy::DropOldest {
            queue.pop_front();
            queue.push_back(datagram);
        }
        false
    }

    /// Number of queued datagrams.
    pub fn buffer_len(&self) -> usize {
        self.queue().len()
    }

    /// Number of datagrams lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the view is open and the shared socket still usable.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self
                .shared
                .upgrade()
                .is_some_and(|shared| shared.is_connected())
    }

    /// Closes this view; the shared socket stays open for other peers.
    ///
    /// Returns `true` for the first call only, which also notifies disconnect listeners.
    pub fn disconnect(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.queue().clear();
        self.disconnect_events.emit(());
        tracing::debug!(peer = %self.peer, "virtual connection closed");
        true
    }

    /// Attaches a listener for datagrams taken through [`Readable::receive`].
    pub fn on_read(&self, listener: impl FnMut(&Vec<u8>) + Send + 'static) -> Subscription<Vec<u8>> {
        self.read_events.subscribe(listener)
    }

    /// Attaches a listener called once when the view closes.
    pub fn on_disconnect(&self, listener: impl FnMut(&()) + Send + 'static) -> Subscription<()> {
        self.disconnect_events.subscribe(listener)
    }
}

impl Readable for VirtualUdpConnection {
    async fn receive(&self) -> Result<Option<Vec<u8>>, Error> {
        let Some(datagram) = self.read() else {
            return Ok(None);
        };
        self.read_events.emit(datagram.clone());
        Ok(Some(datagram))
    }
}

impl Sendable for VirtualUdpConnection {
    /// Sends `payload` as one datagram to the peer, with a single send call.
    ///
    /// Empty payloads are rejected before touching the socket, a partially sent datagram is an
    /// error.
    async fn send(&self, payload: &[u8]) -> Result<bool, Error> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        let Some(shared) = self.shared.upgrade() else {
            return Ok(false);
        };
        let Some(handle) = shared.handle() else {
            return Ok(false);
        };

        let sent = tokio::select! {
            sent = handle.send_to(payload, &self.peer) => sent,
            () = shared.closed() => return Ok(false),
        };

        match sent {
            Ok(0) => {
                tracing::warn!(peer = %self.peer, "socket accepted no bytes");
                Ok(false)
            }
            Ok(written) if written < payload.len() => Err(Error::PartialSend {
                written,
                expected: payload.len(),
            }),
            Ok(_) => Ok(true),
            Err(error) => match ClassificationTable::global().classify_io(&error, Operation::Write) {
                Classification::Unknown => Err(Error::Unknown {
                    operation: Operation::Write,
                    source: error,
                }),
                // Other peers still use the socket, so even fatal errors only fail this send.
                _ => Ok(false),
            },
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::VirtualUdpConnection;
    use crate::handle::scripted::ScriptedSocket;
    use crate::{ConnectionResource, DatagramConfig, Error, OverflowPolicy, PeerAddress, Sendable};

    fn scripted_view(
        socket: ScriptedSocket,
        config: DatagramConfig,
    ) -> (VirtualUdpConnection, Arc<ConnectionResource>, Arc<ScriptedSocket>) {
        let socket = Arc::new(socket);
        let shared = Arc::new(ConnectionResource::scripted(socket.clone()));
        let peer: PeerAddress = "10.0.0.2:5000".parse().unwrap();
        (VirtualUdpConnection::new(&shared, peer, &config), shared, socket)
    }

    #[test_case(OverflowPolicy::DropOldest, &[&b"b"[..], &b"c"[..]]; "drop oldest")]
    #[test_case(OverflowPolicy::RejectNewest, &[&b"a"[..], &b"b"[..]]; "reject newest")]
    fn overflow_policy(overflow: OverflowPolicy, expected: &[&[u8]]) {
        let config = DatagramConfig {
            queue_capacity: 2,
            overflow,
            ..DatagramConfig::default()
        };
        let (view, _shared, _socket) = scripted_view(ScriptedSocket::new(), config);

        assert!(view.add_to_buffer(b"a".to_vec()));
        assert!(view.add_to_buffer(b"b".to_vec()));
        assert!(!view.add_to_buffer(b"c".to_vec()));

        assert_eq!(view.buffer_len(), 2);
        assert_eq!(view.dropped(), 1);
        let drained: Vec<_> = std::iter::from_fn(|| view.read()).collect();
        assert_eq!(drained, expected);
    }

    #[tokio::test]
    async fn empty_payload_is_rejected_without_a_syscall() {
        let (view, _shared, socket) = scripted_view(ScriptedSocket::new(), DatagramConfig::default());
        assert!(matches!(view.send(b"").await, Err(Error::EmptyPayload)));
        assert_eq!(socket.write_attempts(), 0);
    }

    #[tokio::test]
    async fn partial_and_zero_byte_sends() {
        let (view, _shared, socket) = scripted_view(
            ScriptedSocket::new().write(Ok(3)).write(Ok(0)),
            DatagramConfig::default(),
        );
        assert!(matches!(
            view.send(b"hello").await,
            Err(Error::PartialSend {
                written: 3,
                expected: 5
            })
        ));
        assert!(!view.send(b"hello").await.unwrap());
        assert!(view.send(b"hello").await.unwrap());
        assert_eq!(socket.write_attempts(), 3);
    }

    #[tokio::test]
    async fn disconnect_only_closes_the_view() {
        let (view, shared, _socket) = scripted_view(ScriptedSocket::new(), DatagramConfig::default());
        view.add_to_buffer(b"queued".to_vec());

        assert!(view.disconnect());
        assert!(!view.disconnect());
        assert!(!view.is_connected());
        assert_eq!(view.buffer_len(), 0);
        assert!(!view.add_to_buffer(b"late".to_vec()));
        assert!(!view.send(b"late").await.unwrap());
        assert!(shared.is_connected());
    }

    #[tokio::test]
    async fn dropped_shared_socket_fails_sends() {
        let (view, shared, _socket) = scripted_view(ScriptedSocket::new(), DatagramConfig::default());
        drop(shared);
        assert!(!view.is_connected());
        assert!(!view.send(b"data").await.unwrap());
    }
}
