//! The read and send loops of stream connections.
//!
//! Each attempt is one non-blocking syscall. Its outcome is classified through the
//! [`ClassificationTable`] and the loop continues, backs off, gives up or tears the connection
//! down accordingly. Backoff sleeps end early when the resource disconnects, and the resource
//! state is checked again before every attempt.

use std::io;
use std::sync::Arc;

use crate::{Classification, ClassificationTable, ConnectionResource, Error, Operation, RetryPolicy};

/// Largest buffer offered to a single read attempt.
const READ_CHUNK: usize = 64 * 1024;

/// Reads and writes bytes on a shared [`ConnectionResource`].
#[derive(Debug, Clone)]
pub struct SocketChannel {
    resource: Arc<ConnectionResource>,
    retry: RetryPolicy,
    table: &'static ClassificationTable,
}

impl SocketChannel {
    /// Creates a channel using the process-wide classification table.
    pub fn new(resource: Arc<ConnectionResource>, retry: RetryPolicy) -> Self {
        Self {
            resource,
            retry,
            table: ClassificationTable::global(),
        }
    }

    /// Replaces the classification table.
    pub fn with_table(mut self, table: &'static ClassificationTable) -> Self {
        self.table = table;
        self
    }

    /// The resource this channel operates on.
    pub fn resource(&self) -> &Arc<ConnectionResource> {
        &self.resource
    }

    async fn backoff(&self) {
        tokio::select! {
            () = tokio::time::sleep(self.retry.backoff) => {}
            () = self.resource.closed() => {}
        }
    }

    fn stalled(&self, operation: Operation) {
        tracing::warn!(
            %operation,
            attempts = self.retry.max_attempts,
            "no progress within the retry limit, disconnecting",
        );
        self.resource.disconnect();
    }

    /// Reads up to `max_length` bytes.
    ///
    /// Without `exact`, one attempt is made and whatever it produced is returned, possibly
    /// nothing. With `exact`, the call only succeeds with exactly `max_length` bytes; it never
    /// returns a shorter buffer.
    ///
    /// `Ok(None)` means the read failed: the peer closed, the connection was torn down, the
    /// operation was skipped or the resource was not connected.
    pub async fn read(&self, max_length: usize, exact: bool) -> Result<Option<Vec<u8>>, Error> {
        let mut buffer = Vec::new();
        let mut filled = 0;
        let mut attempts = 0;

        loop {
            let Some(handle) = self.resource.handle() else {
                return Ok(None);
            };
            if filled == max_length {
                buffer.truncate(filled);
                return Ok(Some(buffer));
            }

            // The buffer grows with the data actually received.
            buffer.resize(filled + (max_length - filled).min(READ_CHUNK), 0);
            let attempt = handle.try_read(&mut buffer[filled..]);
            drop(handle);

            let error = match attempt {
                Ok(0) => None,
                Ok(read) => {
                    filled += read;
                    attempts = 0;
                    if !exact {
                        buffer.truncate(filled);
                        return Ok(Some(buffer));
                    }
                    if filled < max_length {
                        self.backoff().await;
                    }
                    continue;
                }
                Err(error) => Some(error),
            };

            let classification = match &error {
                // End-of-stream: the peer performed an orderly shutdown.
                None => Classification::None,
                Some(error) => self.table.classify_io(error, Operation::Read),
            };

            match classification {
                Classification::None => {
                    tracing::debug!(peer = ?self.resource.peer_address(), "peer closed the connection");
                    self.resource.disconnect();
                    return Ok(None);
                }
                Classification::Retry if !exact => return Ok(Some(Vec::new())),
                Classification::Retry => {
                    attempts += 1;
                    if attempts > self.retry.max_attempts {
                        self.stalled(Operation::Read);
                        return Ok(None);
                    }
                    self.backoff().await;
                }
                Classification::Skip => return Ok(None),
                Classification::Fatal => {
                    self.resource.disconnect();
                    return Ok(None);
                }
                Classification::Unknown => {
                    return Err(Error::Unknown {
                        operation: Operation::Read,
                        source: error.unwrap_or_else(|| io::ErrorKind::Other.into()),
                    });
                }
            }
        }
    }

    /// Sends all of `buffer`.
    ///
    /// Returns `Ok(true)` once every byte was accepted by the OS and `Ok(false)` if the send was
    /// abandoned: skipped, peer gone, retries exhausted or the resource not connected.
    pub async fn send(&self, buffer: &[u8]) -> Result<bool, Error> {
        let mut written = 0;
        let mut attempts = 0;

        while written < buffer.len() {
            let Some(handle) = self.resource.handle() else {
                return Ok(false);
            };
            let attempt = handle.try_write(&buffer[written..]);
            drop(handle);

            match attempt {
                Ok(0) => {
                    tracing::warn!(written, total = buffer.len(), "socket accepted no bytes");
                    attempts += 1;
                    if attempts > self.retry.max_attempts {
                        self.stalled(Operation::Write);
                        return Ok(false);
                    }
                    self.backoff().await;
                }
                Ok(sent) => {
                    written += sent;
                    attempts = 0;
                }
                Err(error) => match self.table.classify_io(&error, Operation::Write) {
                    Classification::None => {
                        tracing::error!(?error, "write failed without an error code");
                        return Err(Error::Anomalous(error));
                    }
                    Classification::Retry => {
                        attempts += 1;
                        if attempts > self.retry.max_attempts {
                            self.stalled(Operation::Write);
                            return Ok(false);
                        }
                        self.backoff().await;
                    }
                    Classification::Skip => return Ok(false),
                    Classification::Fatal => {
                        self.resource.disconnect();
                        return Ok(false);
                    }
                    Classification::Unknown => {
                        return Err(Error::Unknown {
                            operation: Operation::Write,
                            source: error,
                        });
                    }
                },
            }
        }

        Ok(true)
    }
}
