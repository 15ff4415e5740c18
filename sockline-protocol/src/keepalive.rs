//! Line-based keep-alive.
//!
//! Every frame is one `\n` terminated line. `PING <seq>` is answered with `PONG <seq>` carrying
//! the same sequence number, which is how a pong is matched to its ping. Any other line is an
//! application message and handed to the caller.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sockline_net::{Error, EventRegistry, PingCapable, PingPacket, Readable, Sendable, Subscription};

/// One keep-alive line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A liveness probe.
    Ping(PingPacket),

    /// The answer to a probe.
    Pong(PingPacket),

    /// Anything else.
    Message(String),
}

impl Frame {
    /// Parses one line, without its terminator.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches('\r');
        let packet = |sequence: &str| sequence.trim().parse().ok().map(|sequence| PingPacket { sequence });

        if let Some(packet) = line.strip_prefix("PING ").and_then(packet) {
            Self::Ping(packet)
        } else if let Some(packet) = line.strip_prefix("PONG ").and_then(packet) {
            Self::Pong(packet)
        } else {
            Self::Message(line.to_owned())
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping(packet) => write!(f, "PING {}", packet.sequence),
            Self::Pong(packet) => write!(f, "PONG {}", packet.sequence),
            Self::Message(message) => f.write_str(message),
        }
    }
}

/// Longest line kept while waiting for its terminator.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Reassembles lines from the received units.
///
/// Units may end anywhere, even inside a UTF-8 character, so bytes are only decoded once their
/// line is complete.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
    /// Set while skipping the rest of a line that grew past [`MAX_LINE_LENGTH`].
    discarding: bool,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        if let Some(end) = self.pending.iter().rposition(|&byte| byte == b'\n') {
            let complete: Vec<u8> = self.pending.drain(..=end).collect();
            let mut complete = complete[..end].split(|&byte| byte == b'\n');
            if std::mem::take(&mut self.discarding) {
                complete.next();
            }
            lines.extend(complete.map(|line| String::from_utf8_lossy(line).into_owned()));
        }

        if self.pending.len() > MAX_LINE_LENGTH {
            tracing::warn!(
                length = self.pending.len(),
                max = MAX_LINE_LENGTH,
                "discarding overlong line",
            );
            self.pending.clear();
            self.discarding = true;
        }
        lines
    }
}

/// Keep-alive framing on top of a provider connection.
#[derive(Debug)]
pub struct KeepAlive<P> {
    provider: P,
    next_sequence: AtomicU64,
    outstanding: Mutex<BTreeSet<u64>>,
    lines: Mutex<LineBuffer>,
    pong_events: EventRegistry<PingPacket>,
}

impl<P: Readable + Sendable> KeepAlive<P> {
    /// Wraps `provider`.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            next_sequence: AtomicU64::new(1),
            outstanding: Mutex::new(BTreeSet::new()),
            lines: Mutex::new(LineBuffer::default()),
            pong_events: EventRegistry::new(),
        }
    }

    fn outstanding_set(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The wrapped connection.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Allocates the packet for the next ping.
    pub fn next_packet(&self) -> PingPacket {
        PingPacket {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Pings sent without a matching pong yet, oldest first.
    pub fn outstanding(&self) -> Vec<PingPacket> {
        self.outstanding_set()
            .iter()
            .map(|&sequence| PingPacket { sequence })
            .collect()
    }

    async fn send_frame(&self, frame: &Frame) -> Result<bool, Error> {
        self.provider.send(format!("{frame}\n").as_bytes()).await
    }

    /// Sends an application message as one line.
    pub async fn send_message(&self, message: &str) -> Result<bool, Error> {
        self.send_frame(&Frame::Message(message.to_owned())).await
    }

    /// Takes one unit from the provider and processes the complete lines in it.
    ///
    /// Pings are answered, pongs notify the pong listeners, and the application messages are
    /// returned. An unterminated trailing line is kept until the rest arrives, unless it grows
    /// past 64 KiB, in which case the whole line is dropped.
    pub async fn poll(&self) -> Result<Vec<String>, Error> {
        let Some(bytes) = self.provider.receive().await? else {
            return Ok(Vec::new());
        };

        let lines = self
            .lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&bytes);

        let mut messages = Vec::new();
        for line in lines {
            match Frame::parse(&line) {
                Frame::Ping(packet) => {
                    tracing::debug!(%packet, "ping received");
                    self.send_frame(&Frame::Pong(packet)).await?;
                }
                Frame::Pong(packet) => {
                    if !self.outstanding_set().remove(&packet.sequence) {
                        tracing::debug!(%packet, "unsolicited pong");
                    }
                    self.pong_events.emit(packet);
                }
                Frame::Message(message) if message.is_empty() => {}
                Frame::Message(message) => messages.push(message),
            }
        }
        Ok(messages)
    }
}

impl<P: Readable + Sendable> PingCapable for KeepAlive<P> {
    async fn ping(&self, packet: PingPacket) -> Result<bool, Error> {
        let sent = self.send_frame(&Frame::Ping(packet)).await?;
        if sent {
            self.outstanding_set().insert(packet.sequence);
        }
        Ok(sent)
    }

    fn pong(&self, listener: impl FnMut(&PingPacket) + Send + 'static) -> Subscription<PingPacket> {
        self.pong_events.subscribe(listener)
    }
}
