//! TCP ingestion server
//!
//! Accepts device connections and feeds every newline-delimited record
//! through the shared [`FogPipeline`]. Each connection runs in its own task;
//! the accept loop and all connection loops stop when the shutdown token is
//! cancelled.

use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{FogError, FogResult};
use crate::pipeline::FogPipeline;

/// Longest accepted line; longer lines are discarded
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A line the codec skipped without ending the connection
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DroppedLine {
    #[error("line exceeds {0} bytes")]
    TooLong(usize),

    #[error("line is not valid UTF-8")]
    NotUtf8,
}

/// Newline framing that reports bad lines as items instead of stream errors.
///
/// `FramedRead` ends the stream after any decoder error, so oversized and
/// undecodable lines are surfaced as `Err(DroppedLine)` items and only real
/// I/O failures close the connection.
#[derive(Debug)]
pub struct DeviceLineCodec {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl DeviceLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_length),
            max_length,
        }
    }

    fn frame(
        &self,
        decoded: Result<Option<bytes::Bytes>, AnyDelimiterCodecError>,
    ) -> io::Result<Option<Result<String, DroppedLine>>> {
        match decoded {
            Ok(Some(chunk)) => Ok(Some(
                std::str::from_utf8(&chunk)
                    .map(str::to_owned)
                    .map_err(|_| DroppedLine::NotUtf8),
            )),
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                Ok(Some(Err(DroppedLine::TooLong(self.max_length))))
            }
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for DeviceLineCodec {
    type Item = Result<String, DroppedLine>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        let decoded = self.inner.decode(src);
        self.frame(decoded)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        let decoded = self.inner.decode_eof(src);
        self.frame(decoded)
    }
}

/// How long shutdown waits for connection tasks to finish
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound TCP listener serving device connections
pub struct IngestionServer {
    listener: TcpListener,
    pipeline: Arc<FogPipeline>,
    connections: TaskTracker,
}

impl IngestionServer {
    /// Bind the listening socket. This is the only fatal startup failure.
    pub async fn bind(address: &str, pipeline: Arc<FogPipeline>) -> FogResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| FogError::Bind {
                address: address.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            pipeline,
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> FogResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled, then close every
    /// open connection and wait (bounded) for their tasks to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let address = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(address = %address, "Fog ingestion server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let pipeline = Arc::clone(&self.pipeline);
                        let shutdown = shutdown.clone();
                        self.connections.spawn(async move {
                            handle_connection(stream, peer, pipeline, shutdown).await;
                        });
                    }
                    Err(e) => {
                        // Per-accept failures (e.g. fd exhaustion) do not stop the listener
                        warn!(error = %e, "Failed to accept device connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }

        info!(
            open_connections = self.connections.len(),
            "Ingestion server stopping"
        );
        drop(self.listener);

        self.connections.close();
        if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, self.connections.wait())
            .await
            .is_err()
        {
            warn!("Timed out waiting for device connections to close");
        }
    }
}

/// Serve one device connection until it closes, errors, or shutdown
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<FogPipeline>,
    shutdown: CancellationToken,
) {
    info!(peer = %peer, "Device connected");

    let mut lines = FramedRead::new(stream, DeviceLineCodec::new(MAX_LINE_LENGTH));
    let mut processed: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(peer = %peer, "Closing device connection for shutdown");
                break;
            }
            next = lines.next() => next,
        };

        match next {
            Some(Ok(Ok(line))) => {
                pipeline.handle_line(&line).await;
                processed += 1;
            }
            Some(Ok(Err(dropped))) => {
                warn!(peer = %peer, reason = %dropped, "Dropping unreadable line");
            }
            Some(Err(e)) => {
                let err = FogError::from(e);
                warn!(peer = %peer, error = %err, "Device connection error");
                break;
            }
            None => break,
        }
    }

    info!(peer = %peer, lines = processed, "Device disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn frames(input: &[u8], max_length: usize) -> Vec<Result<String, DroppedLine>> {
        FramedRead::new(input, DeviceLineCodec::new(max_length))
            .map(|item| item.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_splits_on_newlines() {
        let items = frames(b"one\ntwo\r\nthree", 64).await;
        assert_eq!(
            items,
            vec![
                Ok("one".to_string()),
                Ok("two\r".to_string()),
                Ok("three".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let mut input = b"ok\n".to_vec();
        input.extend(std::iter::repeat(b'x').take(40));
        input.extend_from_slice(b"\nafter\n");

        let items = frames(&input, 16).await;
        assert_eq!(items.first(), Some(&Ok("ok".to_string())));
        assert!(items.contains(&Err(DroppedLine::TooLong(16))));
        assert_eq!(items.last(), Some(&Ok("after".to_string())));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_skipped() {
        let items = frames(b"{\"bpm\":\xff}\nnext\n", 64).await;
        assert_eq!(
            items,
            vec![Err(DroppedLine::NotUtf8), Ok("next".to_string())]
        );
    }
}
