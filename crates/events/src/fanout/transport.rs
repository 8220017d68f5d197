use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Delivery failure reported by a transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The remote end went away.
    #[error("transport closed")]
    Closed,

    #[error("transport io error: {0}")]
    Io(String),
}

/// Outbound side of one subscriber connection (SSE stream, websocket, ...).
#[async_trait]
pub trait SubscriberTransport<M>: Send + Sync + 'static {
    /// Called once before the connection is admitted as `active`.
    async fn handshake(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Deliver one message.
    async fn send(&mut self, message: &M) -> Result<(), TransportError>;

    /// Resolves when the remote end is known to be gone.
    ///
    /// The default never resolves; closure is then detected on the next send.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Transport backed by a bounded tokio channel.
///
/// The route layer keeps the receiver and turns it into a response stream;
/// dropping the receiver closes the connection.
#[derive(Debug)]
pub struct ChannelTransport<M> {
    tx: mpsc::Sender<M>,
    hello: Option<M>,
}

impl<M> ChannelTransport<M> {
    pub fn new(tx: mpsc::Sender<M>) -> Self {
        Self { tx, hello: None }
    }

    /// Create a transport and its receiving end.
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    /// Message sent as part of the handshake (e.g. a "connected" frame).
    pub fn with_hello(mut self, hello: M) -> Self {
        self.hello = Some(hello);
        self
    }
}

#[async_trait]
impl<M> SubscriberTransport<M> for ChannelTransport<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn handshake(&mut self) -> Result<(), TransportError> {
        if let Some(hello) = self.hello.take() {
            self.tx.send(hello).await.map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    async fn send(&mut self, message: &M) -> Result<(), TransportError> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}
