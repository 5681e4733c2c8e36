//! In-memory transports for testing.

use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::unbounded_channel;

use crate::transport;
use crate::transport::Transport;

/// One end of an in-memory byte pipe.
///
/// Chunks sent on one end come out of the other's `recv` unchanged.
/// `close` ends the peer's stream once it drained what was queued, while
/// this end keeps receiving.
pub struct DuplexChannelTransport {
    outbound: StdMutex<Option<UnboundedSender<Vec<u8>>>>,
    inbound: Mutex<UnboundedReceiver<Vec<u8>>>,
}

impl DuplexChannelTransport {
    pub fn new(outbound: UnboundedSender<Vec<u8>>, inbound: UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            outbound: StdMutex::new(Some(outbound)),
            inbound: Mutex::new(inbound),
        }
    }

    /// Two connected ends.
    pub fn pair() -> (Self, Self) {
        let (to_right, from_left) = unbounded_channel();
        let (to_left, from_right) = unbounded_channel();
        (Self::new(to_right, from_right), Self::new(to_left, from_left))
    }

    fn outbound(&self) -> std::sync::MutexGuard<'_, Option<UnboundedSender<Vec<u8>>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let outbound = self.outbound();
        let Some(tx) = outbound.as_ref() else {
            return Err(transport::Error::ConnectionLost("Sending side closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("Peer dropped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        Ok(self.inbound.lock().await.recv().await)
    }

    async fn close(&self) -> transport::Result<()> {
        self.outbound().take();
        Ok(())
    }
}
