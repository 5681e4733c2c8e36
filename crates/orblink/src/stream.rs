//! Transport over any tokio byte stream (TCP, unix sockets, `tokio::io::duplex`).

use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport;
use crate::transport::Transport;

const READ_CHUNK: usize = 8 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writes go through a queue drained by a writer task, so `send` never
/// waits on the peer reading.
pub struct StreamTransport {
    queue: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    writer: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    reader: Mutex<BoxedReader>,
}

impl StreamTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_queue(writer, rx));
        Self {
            queue: StdMutex::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
            reader: Mutex::new(Box::new(reader)),
        }
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

async fn write_queue<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> std::io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        writer.write_all(&chunk).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

#[async_trait::async_trait]
impl Transport for StreamTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(queue) = queue else {
            return Err(transport::Error::ConnectionLost("Stream closed".into()));
        };
        queue
            .send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("Writer stopped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn close(&self) -> transport::Result<()> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
        let handle = self.writer.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result.map_err(transport::Error::from),
            Err(e) => {
                debug!(error = %e, "stream writer task failed");
                Err(transport::Error::Io(e.to_string()))
            }
        }
    }
}
