//! An in-memory connection for protocol tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use sockline_net::{Error, Readable, Sendable};

/// Hands out scripted inbound units and records everything sent.
#[derive(Debug, Default)]
pub(crate) struct MemoryConnection {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryConnection {
    pub(crate) fn with_inbound<'a>(units: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let connection = Self::default();
        for unit in units {
            connection.push_inbound(unit);
        }
        connection
    }

    pub(crate) fn push_inbound(&self, unit: &[u8]) {
        self.inbound.lock().unwrap().push_back(unit.to_vec());
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl Readable for MemoryConnection {
    async fn receive(&self) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.inbound.lock().unwrap().pop_front())
    }
}

impl Sendable for MemoryConnection {
    async fn send(&self, payload: &[u8]) -> Result<bool, Error> {
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(true)
    }
}
