//! Owned OS sockets behind a connection resource.
//!
//! Every attempt made through a [`SocketHandle`] is a single non-blocking syscall; waiting and
//! retrying is the caller's business.

use std::io;
use std::net::{Ipv4Addr, Shutdown};

use camino::Utf8PathBuf;
use socket2::{Protocol, SockAddr, SockRef, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket, UnixDatagram, UnixListener, UnixStream};

use crate::{AddressFamily, PeerAddress};

const LISTEN_BACKLOG: u32 = 1024;

/// Removes a bound Unix socket path from the filesystem once the socket is gone.
#[derive(Debug)]
pub(crate) enum PathGuard {
    /// A path chosen by the user.
    Bound(Utf8PathBuf),

    /// A path chosen for an ephemeral client socket.
    Temporary(tempfile::TempPath),
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // `TempPath` cleans up after itself.
        let Self::Bound(path) = self else {
            return;
        };
        if let Err(error) = std::fs::remove_file(path.as_std_path())
            && error.kind() != io::ErrorKind::NotFound
        {
            tracing::error!(?error, %path, "error removing unix socket");
        }
    }
}

/// A socket of any transport and family supported by the crate.
#[derive(Debug)]
pub(crate) enum SocketHandle {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp(UdpSocket),
    UnixDatagram(UnixDatagram, PathGuard),
    TcpListener(TcpListener),
    UnixListener(UnixListener, PathGuard),
    #[cfg(test)]
    Scripted(std::sync::Arc<scripted::ScriptedSocket>),
}

fn unsupported(operation: &str, handle: &SocketHandle) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{operation} is not supported on {} sockets", handle.kind()),
    )
}

fn invalid_address(address: &PeerAddress) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{address} does not match the socket's address family"),
    )
}

impl SocketHandle {
    /// Opens a stream connection to `address`.
    pub(crate) async fn connect_stream(address: &PeerAddress) -> io::Result<Self> {
        match address {
            PeerAddress::Ipv4(ip) => Ok(Self::Tcp(TcpStream::connect(*ip).await?)),
            PeerAddress::Unix(path) => Ok(Self::Unix(UnixStream::connect(path).await?)),
        }
    }

    /// Binds a listening stream socket at `address`.
    pub(crate) fn bind_listener(address: &PeerAddress) -> io::Result<Self> {
        match address {
            PeerAddress::Ipv4(ip) => {
                let socket = TcpSocket::new_v4()?;
                socket.set_reuseaddr(true)?;
                socket.bind((*ip).into())?;
                Ok(Self::TcpListener(socket.listen(LISTEN_BACKLOG)?))
            }
            PeerAddress::Unix(path) => {
                let listener = UnixListener::bind(path)?;
                Ok(Self::UnixListener(listener, PathGuard::Bound(path.clone())))
            }
        }
    }

    /// Binds a datagram socket at `address`.
    pub(crate) fn bind_datagram(address: &PeerAddress) -> io::Result<Self> {
        match address {
            PeerAddress::Ipv4(ip) => {
                // Neither Tokio nor std can set `SO_REUSEADDR` on a UDP socket.
                let socket = socket2::Socket::new(
                    socket2::Domain::IPV4,
                    Type::DGRAM,
                    Some(Protocol::UDP),
                )?;
                socket.set_reuse_address(true)?;
                socket.set_nonblocking(true)?;
                socket.bind(&SockAddr::from(*ip))?;
                Ok(Self::Udp(UdpSocket::from_std(socket.into())?))
            }
            PeerAddress::Unix(path) => {
                let socket = UnixDatagram::bind(path)?;
                Ok(Self::UnixDatagram(socket, PathGuard::Bound(path.clone())))
            }
        }
    }

    /// Binds a datagram socket on an address picked by the system.
    ///
    /// Unix sockets get a fresh path in the temporary directory so peers can answer them.
    pub(crate) fn bind_ephemeral_datagram(family: AddressFamily) -> io::Result<Self> {
        match family {
            AddressFamily::Ipv4 => Self::bind_datagram(&PeerAddress::ipv4(Ipv4Addr::UNSPECIFIED, 0)),
            AddressFamily::Unix => {
                let (socket, path) = tempfile::Builder::new()
                    .prefix("sockline-")
                    .suffix(".sock")
                    .make(|path| UnixDatagram::bind(path))?
                    .into_parts();
                Ok(Self::UnixDatagram(socket, PathGuard::Temporary(path)))
            }
        }
    }

    /// Short description used in logs and errors.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp stream",
            Self::Unix(_) => "unix stream",
            Self::Udp(_) => "udp",
            Self::UnixDatagram(..) => "unix datagram",
            Self::TcpListener(_) => "tcp listener",
            Self::UnixListener(..) => "unix listener",
            #[cfg(test)]
            Self::Scripted(_) => "scripted",
        }
    }

    /// Reads whatever is available, without waiting.
    pub(crate) fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.try_read(buffer),
            Self::Unix(stream) => stream.try_read(buffer),
            Self::Udp(socket) => socket.try_recv(buffer),
            Self::UnixDatagram(socket, _) => socket.try_recv(buffer),
            Self::TcpListener(_) | Self::UnixListener(..) => Err(unsupported("reading", self)),
            #[cfg(test)]
            Self::Scripted(socket) => socket.try_read(buffer),
        }
    }

    /// Writes as much of `buffer` as the OS takes, without waiting.
    pub(crate) fn try_write(&self, buffer: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.try_write(buffer),
            Self::Unix(stream) => stream.try_write(buffer),
            Self::Udp(_) | Self::UnixDatagram(..) | Self::TcpListener(_) | Self::UnixListener(..) => {
                Err(unsupported("stream writing", self))
            }
            #[cfg(test)]
            Self::Scripted(socket) => socket.try_write(buffer),
        }
    }

    /// Receives one pending datagram and its source, without waiting.
    ///
    /// The source is `None` when it cannot be addressed (unnamed Unix sockets).
    pub(crate) fn try_recv_from(
        &self,
        buffer: &mut [u8],
    ) -> io::Result<(usize, Option<PeerAddress>)> {
        match self {
            Self::Udp(socket) => {
                let (length, source) = socket.try_recv_from(buffer)?;
                Ok((length, PeerAddress::try_from(source).ok()))
            }
            Self::UnixDatagram(socket, _) => {
                let (length, source) = socket.try_recv_from(buffer)?;
                let source: std::os::unix::net::SocketAddr = source.into();
                Ok((length, PeerAddress::try_from(&source).ok()))
            }
            #[cfg(test)]
            Self::Scripted(socket) => socket.try_recv_from(buffer),
            _ => Err(unsupported("datagram receiving", self)),
        }
    }

    /// Sends one datagram to `target`.
    pub(crate) async fn send_to(&self, buffer: &[u8], target: &PeerAddress) -> io::Result<usize> {
        match self {
            Self::Udp(socket) => {
                let address = target.as_socket_addr().ok_or_else(|| invalid_address(target))?;
                socket.send_to(buffer, address).await
            }
            Self::UnixDatagram(socket, _) => {
                let path = target.as_path().ok_or_else(|| invalid_address(target))?;
                socket.send_to(buffer, path).await
            }
            #[cfg(test)]
            Self::Scripted(socket) => socket.try_write(buffer),
            _ => Err(unsupported("datagram sending", self)),
        }
    }

    /// Waits until the socket may have data to read.
    pub(crate) async fn readable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.readable().await,
            Self::Unix(stream) => stream.readable().await,
            Self::Udp(socket) => socket.readable().await,
            Self::UnixDatagram(socket, _) => socket.readable().await,
            Self::TcpListener(_) | Self::UnixListener(..) => Err(unsupported("reading", self)),
            #[cfg(test)]
            Self::Scripted(_) => Ok(()),
        }
    }

    /// Accepts the next incoming stream connection.
    ///
    /// Unnamed Unix clients are reported under the listener's own path.
    pub(crate) async fn accept(&self) -> io::Result<(Self, PeerAddress)> {
        match self {
            Self::TcpListener(listener) => {
                let (stream, address) = listener.accept().await?;
                let address = PeerAddress::try_from(address)
                    .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
                Ok((Self::Tcp(stream), address))
            }
            Self::UnixListener(listener, guard) => {
                let (stream, address) = listener.accept().await?;
                let address: std::os::unix::net::SocketAddr = address.into();
                let address = PeerAddress::try_from(&address).unwrap_or_else(|_| match guard {
                    PathGuard::Bound(path) => PeerAddress::Unix(path.clone()),
                    PathGuard::Temporary(path) => {
                        PeerAddress::Unix(Utf8PathBuf::from(path.to_string_lossy().into_owned()))
                    }
                });
                Ok((Self::Unix(stream), address))
            }
            _ => Err(unsupported("accepting", self)),
        }
    }

    /// Returns the local address, if it is addressable.
    pub(crate) fn local_address(&self) -> Option<PeerAddress> {
        fn unix(address: io::Result<tokio::net::unix::SocketAddr>) -> Option<PeerAddress> {
            let address: std::os::unix::net::SocketAddr = address.ok()?.into();
            PeerAddress::try_from(&address).ok()
        }

        match self {
            Self::Tcp(stream) => PeerAddress::try_from(stream.local_addr().ok()?).ok(),
            Self::Udp(socket) => PeerAddress::try_from(socket.local_addr().ok()?).ok(),
            Self::TcpListener(listener) => PeerAddress::try_from(listener.local_addr().ok()?).ok(),
            Self::Unix(stream) => unix(stream.local_addr()),
            Self::UnixDatagram(socket, _) => unix(socket.local_addr()),
            Self::UnixListener(listener, _) => unix(listener.local_addr()),
            #[cfg(test)]
            Self::Scripted(_) => None,
        }
    }

    /// Shuts both directions of a stream down so the peer observes end-of-stream.
    pub(crate) fn shutdown(&self) {
        let result = match self {
            Self::Tcp(stream) => SockRef::from(stream).shutdown(Shutdown::Both),
            Self::Unix(stream) => SockRef::from(stream).shutdown(Shutdown::Both),
            _ => Ok(()),
        };
        if let Err(error) = result
            && error.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!(?error, kind = self.kind(), "error shutting socket down");
        }
    }
}

/// A fake socket replaying a fixed script, to drive the I/O loops through every classification.
#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
pub(crate) mod scripted {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::PeerAddress;

    /// Once the read script is exhausted every read would block, once the write script is
    /// exhausted every write is accepted whole.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedSocket {
        reads: Mutex<VecDeque<io::Result<Vec<u8>>>>,
        datagrams: Mutex<VecDeque<(PeerAddress, Vec<u8>)>>,
        writes: Mutex<VecDeque<io::Result<usize>>>,
        written: Mutex<Vec<u8>>,
        read_attempts: AtomicUsize,
        write_attempts: AtomicUsize,
    }

    impl ScriptedSocket {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Appends a read outcome; `Ok(vec![])` is end-of-stream.
        pub(crate) fn read(mut self, step: io::Result<Vec<u8>>) -> Self {
            self.reads.get_mut().unwrap().push_back(step);
            self
        }

        /// Queues a datagram from `source`; datagrams are only seen by `try_recv_from`.
        pub(crate) fn datagram(mut self, source: PeerAddress, bytes: &[u8]) -> Self {
            self.datagrams
                .get_mut()
                .unwrap()
                .push_back((source, bytes.to_vec()));
            self
        }

        /// Appends a write outcome, the number of bytes taken or an error.
        pub(crate) fn write(mut self, step: io::Result<usize>) -> Self {
            self.writes.get_mut().unwrap().push_back(step);
            self
        }

        pub(crate) fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }

        pub(crate) fn read_attempts(&self) -> usize {
            self.read_attempts.load(Ordering::SeqCst)
        }

        pub(crate) fn write_attempts(&self) -> usize {
            self.write_attempts.load(Ordering::SeqCst)
        }

        pub(super) fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
            self.read_attempts.fetch_add(1, Ordering::SeqCst);
            let mut reads = self.reads.lock().unwrap();
            match reads.pop_front() {
                None => Err(io::Error::from_raw_os_error(libc::EAGAIN)),
                Some(Err(error)) => Err(error),
                Some(Ok(mut bytes)) => {
                    let length = bytes.len().min(buffer.len());
                    buffer[..length].copy_from_slice(&bytes[..length]);
                    if length < bytes.len() {
                        reads.push_front(Ok(bytes.split_off(length)));
                    }
                    Ok(length)
                }
            }
        }

        /// Like a real datagram socket, the part that does not fit into `buffer` is lost.
        pub(super) fn try_recv_from(
            &self,
            buffer: &mut [u8],
        ) -> io::Result<(usize, Option<PeerAddress>)> {
            self.read_attempts.fetch_add(1, Ordering::SeqCst);
            let Some((source, bytes)) = self.datagrams.lock().unwrap().pop_front() else {
                return Err(io::Error::from_raw_os_error(libc::EAGAIN));
            };
            let length = bytes.len().min(buffer.len());
            buffer[..length].copy_from_slice(&bytes[..length]);
            Ok((length, Some(source)))
        }

        pub(super) fn try_write(&self, buffer: &[u8]) -> io::Result<usize> {
            self.write_attempts.fetch_add(1, Ordering::SeqCst);
            let taken = match self.writes.lock().unwrap().pop_front() {
                None => buffer.len(),
                Some(step) => step?.min(buffer.len()),
            };
            self.written
                .lock()
                .unwrap()
                .extend_from_slice(&buffer[..taken]);
            Ok(taken)
        }
    }
}
