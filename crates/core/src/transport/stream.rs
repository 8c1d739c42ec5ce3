//! Channel-backed log stream with a non-blocking read side
//!
//! The network side (an HTTP body, a test script) is pumped into a bounded
//! channel by a background task. The session side only ever calls
//! [`LogStream::try_read`], which checks readiness with zero timeout, so a
//! scheduler tick never waits on the network.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::{CoreError, Result};

/// Outcome of one non-blocking read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRead {
    /// A chunk of raw bytes
    Data(Bytes),
    /// Nothing available right now
    Empty,
    /// The connection ended; no more data will arrive
    Closed,
}

/// Persistent connection owned by one log session
pub trait LogStream: Send {
    /// Return what is available right now without waiting
    fn try_read(&mut self) -> StreamRead;

    /// Tear the connection down; further reads return `Closed`
    fn close(&mut self);
}

/// Write half handed to the pump task
///
/// Cloning is cheap (Arc-based) and allows multiple producers.
#[derive(Clone)]
pub struct StreamFeeder {
    tx: mpsc::Sender<Bytes>,
}

impl StreamFeeder {
    /// Send a chunk, waiting while the buffer is full (backpressure)
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(data)
            .await
            .map_err(|_| CoreError::Transport("log stream reader dropped".into()))
    }

    /// Try send without waiting (non-blocking)
    pub fn try_send(&self, data: Bytes) -> std::result::Result<(), mpsc::error::TrySendError<Bytes>> {
        self.tx.try_send(data)
    }

    /// True once the session closed or dropped the stream
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read half kept by the session
pub struct ChannelStream {
    rx: mpsc::Receiver<Bytes>,
    closed: bool,
}

impl ChannelStream {
    /// Create a connected pair with the given chunk capacity
    pub fn new(capacity: usize) -> (StreamFeeder, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (StreamFeeder { tx }, Self { rx, closed: false })
    }
}

impl LogStream for ChannelStream {
    fn try_read(&mut self) -> StreamRead {
        if self.closed {
            return StreamRead::Closed;
        }
        match self.rx.try_recv() {
            Ok(data) => StreamRead::Data(data),
            Err(TryRecvError::Empty) => StreamRead::Empty,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                StreamRead::Closed
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}

/// Pump a byte stream into a feeder until either side ends
///
/// Returns `Ok(())` when the source ends or the reader goes away, and the
/// source error otherwise. Dropping the feeder afterwards signals `Closed`
/// to the reader.
pub async fn pump_to_channel<S, E>(mut source: S, feeder: StreamFeeder) -> Result<()>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(chunk) = source.next().await {
        let chunk = chunk.map_err(|e| CoreError::Transport(e.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        let len = chunk.len();
        if feeder.send(chunk).await.is_err() {
            tracing::debug!("Log stream reader gone, stopping pump");
            return Ok(());
        }
        tracing::trace!("Pumped {} bytes into log stream", len);
    }
    tracing::debug!("Log stream source ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_empty_then_data_then_closed() {
        let (feeder, mut stream) = ChannelStream::new(4);
        assert_eq!(stream.try_read(), StreamRead::Empty);

        feeder.send(Bytes::from("hello")).await.unwrap();
        assert_eq!(stream.try_read(), StreamRead::Data(Bytes::from("hello")));

        drop(feeder);
        assert_eq!(stream.try_read(), StreamRead::Closed);
        assert_eq!(stream.try_read(), StreamRead::Closed);
    }

    #[tokio::test]
    async fn test_close_is_seen_by_feeder() {
        let (feeder, mut stream) = ChannelStream::new(4);
        stream.close();
        assert!(feeder.is_closed());
        assert_eq!(stream.try_read(), StreamRead::Closed);
        assert!(feeder.send(Bytes::from("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_try_send_fails_when_full() {
        let (feeder, _stream) = ChannelStream::new(1);
        feeder.try_send(Bytes::from("a")).unwrap();
        assert!(feeder.try_send(Bytes::from("b")).is_err());
    }

    #[tokio::test]
    async fn test_pump_forwards_chunks() {
        let (feeder, mut stream) = ChannelStream::new(8);
        let source = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("a")),
            Ok(Bytes::new()),
            Ok(Bytes::from("b")),
        ]);

        pump_to_channel(source, feeder).await.unwrap();

        assert_eq!(stream.try_read(), StreamRead::Data(Bytes::from("a")));
        assert_eq!(stream.try_read(), StreamRead::Data(Bytes::from("b")));
        assert_eq!(stream.try_read(), StreamRead::Closed);
    }

    #[tokio::test]
    async fn test_pump_reports_source_error() {
        let (feeder, _stream) = ChannelStream::new(8);
        let source = stream::iter(vec![Err::<Bytes, _>(std::io::Error::other("reset"))]);
        let result = pump_to_channel(source, feeder).await;
        assert!(matches!(result, Err(CoreError::Transport(_))));
    }
}
