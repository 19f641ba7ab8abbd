// ABOUTME: Bidirectional gRPC stream halves for agent message streaming.
// ABOUTME: Typed sender/receiver wrappers over the outbound mpsc channel and tonic Streaming.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;

/// Default buffer size for outbound message channels.
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

/// Why a write onto a stream failed.
#[derive(Debug, Clone)]
pub enum WriteError {
    /// End of stream: the peer or transport is no longer reading.
    Closed,
    /// Any other failure.
    Failed(tonic::Status),
}

/// Sender half of a bidirectional stream.
///
/// Wraps an mpsc sender for outgoing messages with convenience methods.
#[derive(Debug, Clone)]
pub struct StreamSender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> StreamSender<T> {
    /// Create a stream sender from an mpsc sender.
    pub fn new(sender: mpsc::Sender<T>) -> Self {
        Self { inner: sender }
    }

    /// Send a message on the stream.
    pub async fn send(&self, msg: T) -> Result<(), WriteError> {
        self.inner.send(msg).await.map_err(|_| WriteError::Closed)
    }
}

/// Receiver half of a bidirectional stream.
///
/// Wraps a tonic Streaming. `Ok(None)` is a clean end of stream.
pub struct StreamReceiver<T> {
    inner: Streaming<T>,
}

impl<T> StreamReceiver<T> {
    /// Create a stream receiver from a tonic Streaming.
    pub fn new(streaming: Streaming<T>) -> Self {
        Self { inner: streaming }
    }

    /// Receive the next message from the stream.
    pub async fn recv(&mut self) -> Result<Option<T>, tonic::Status> {
        self.inner.message().await
    }
}

/// A pair of sender and outbound stream for initiating bidirectional communication.
///
/// The outbound stream should be passed to the gRPC client method,
/// while the sender is used to send messages.
pub struct OutboundStream<T> {
    /// Sender for pushing messages to the stream.
    pub sender: StreamSender<T>,
    /// The stream to pass to the gRPC method.
    pub stream: ReceiverStream<T>,
}

impl<T> OutboundStream<T> {
    /// Create an outbound stream pair with the specified buffer size.
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Self {
            sender: StreamSender::new(tx),
            stream: ReceiverStream::new(rx),
        }
    }

    /// Create an outbound stream pair with the default buffer size.
    pub fn with_default_buffer() -> Self {
        Self::new(DEFAULT_CHANNEL_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_outbound_stream_delivers_in_order() {
        let OutboundStream { sender, mut stream } = OutboundStream::<u32>::new(4);
        sender.send(1).await.unwrap();
        sender.send(2).await.unwrap();
        drop(sender);

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_stream_sender_send_closed() {
        let (tx, rx) = mpsc::channel::<String>(10);
        let sender = StreamSender::new(tx);

        // Drop receiver to close the channel
        drop(rx);

        let result = sender.send("hello".to_string()).await;
        assert!(matches!(result, Err(WriteError::Closed)));
    }

    #[tokio::test]
    async fn test_outbound_stream_ends_when_sender_dropped() {
        let OutboundStream { sender, mut stream } =
            OutboundStream::<String>::with_default_buffer();
        sender.send("last".to_string()).await.unwrap();
        drop(sender);

        assert_eq!(stream.next().await.as_deref(), Some("last"));
        assert!(stream.next().await.is_none());
    }
}
