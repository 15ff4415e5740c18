//! Request/response dispatch over any readable and sendable connection.

use sockline_net::{EventRegistry, Readable, Sendable, Subscription};

use crate::{HeadDecodeError, Request, Response};

/// Errors of the protocol layer.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// The connection failed hard.
    #[error("connection error")]
    Net(#[from] sockline_net::Error),

    /// The received unit is not a valid head block.
    #[error("failed to decode request")]
    Decode(#[from] HeadDecodeError),
}

/// Decodes requests from a provider connection and encodes responses onto it.
#[derive(Debug)]
pub struct HeadProtocol<P> {
    provider: P,
    receive_events: EventRegistry<Request>,
}

impl<P: Readable + Sendable> HeadProtocol<P> {
    /// Wraps `provider`.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            receive_events: EventRegistry::new(),
        }
    }

    /// The wrapped connection.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Takes one unit from the provider and decodes it.
    ///
    /// Receive listeners are notified for every decoded request. `Ok(None)` when the provider had
    /// nothing to offer.
    pub async fn poll(&self) -> Result<Option<Request>, ProtocolError> {
        let Some(bytes) = self.provider.receive().await? else {
            return Ok(None);
        };
        let request = Request::decode(&bytes)?;
        tracing::debug!(method = %request.method, target = %request.target, "request");
        self.receive_events.emit(request.clone());
        Ok(Some(request))
    }

    /// Encodes and sends `response`.
    pub async fn send(&self, response: &Response) -> Result<bool, ProtocolError> {
        Ok(self.provider.send(&response.encode()).await?)
    }

    /// Attaches a listener for decoded requests.
    pub fn on_receive(&self, listener: impl FnMut(&Request) + Send + 'static) -> Subscription<Request> {
        self.receive_events.subscribe(listener)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{HeadProtocol, ProtocolError};
    use crate::testing::MemoryConnection;
    use crate::{HeadDecodeError, Response};

    #[tokio::test]
    async fn every_subscriber_sees_each_request() {
        let protocol = HeadProtocol::new(MemoryConnection::with_inbound([
            &b"GET /a\r\n\r\n"[..],
            &b"GET /b\r\n\r\n"[..],
        ]));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for subscriber in ["first", "second"] {
            let tx = tx.clone();
            protocol.on_receive(move |request| {
                tx.send(format!("{subscriber}:{}", request.target)).unwrap();
            });
        }

        assert_eq!(protocol.poll().await.unwrap().unwrap().target, "/a");
        assert_eq!(protocol.poll().await.unwrap().unwrap().target, "/b");
        assert!(protocol.poll().await.unwrap().is_none());

        let mut seen = Vec::new();
        while seen.len() < 4 {
            seen.push(
                tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(seen, ["first:/a", "second:/a", "first:/b", "second:/b"]);
    }

    #[tokio::test]
    async fn decode_errors_reach_the_caller() {
        let protocol = HeadProtocol::new(MemoryConnection::with_inbound([&b"GET /\r\nbroken\r\n\r\n"[..]]));
        assert!(matches!(
            protocol.poll().await,
            Err(ProtocolError::Decode(HeadDecodeError::MalformedHeader(_)))
        ));
    }

    #[tokio::test]
    async fn responses_are_encoded_onto_the_provider() {
        let protocol = HeadProtocol::new(MemoryConnection::default());
        assert!(protocol.send(&Response::new("200 OK").with_body("hi")).await.unwrap());
        assert_eq!(protocol.provider().sent(), [b"200 OK\r\n\r\nhi".to_vec()]);
    }
}
