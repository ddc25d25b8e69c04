//! Per-connection transport
//!
//! Every accepted socket is split in two. The read half goes to the session
//! loop; the write half is owned by a dedicated writer task that drains a
//! bounded outbound queue and enforces a per-line write timeout. Everything
//! else in the server only ever talks to a [`ConnectionHandle`].

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// Stable identity of one accepted connection
pub type ConnectionId = Uuid;

/// Outbound behaviour of a connection
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Lines that may be queued for a recipient before it counts as stalled
    pub outbound_queue: usize,
    /// Upper bound on a single socket write
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared handle to a live connection.
///
/// Cheap to clone; the registry, the broadcaster and the owning session all
/// hold one.
///
/// There are two ways to end a connection. [`close`](Self::close) stops the
/// writer at once and discards whatever is still queued; eviction and server
/// shutdown use it. [`drain`](Self::drain) stops accepting new output but lets
/// the writer flush what is already queued, each write still bounded by the
/// write timeout; a session that ends on its own uses it.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    draining: CancellationToken,
}

impl ConnectionHandle {
    /// Build a handle around an outbound queue.
    ///
    /// `closed` is usually a child of the server's shutdown token.
    pub fn new(
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            outbound,
            closed,
            draining: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue bytes without waiting.
    ///
    /// A full queue means the peer is not keeping up; a closed queue means
    /// the writer already gave up. Both are delivery failures.
    pub fn try_enqueue(&self, data: Bytes) -> Result<()> {
        if self.is_closed() || self.is_draining() {
            return Err(ChatError::connection(format!(
                "Connection {} is closed",
                self.remote_addr
            )));
        }

        self.outbound.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => ChatError::resource_limit(format!(
                "Outbound queue full for {}",
                self.remote_addr
            )),
            TrySendError::Closed(_) => ChatError::connection(format!(
                "Writer for {} has stopped",
                self.remote_addr
            )),
        })
    }

    /// Queue bytes, waiting for room in this connection's own queue.
    ///
    /// Only used for replies to the connection's own input, so a slow peer
    /// only ever stalls its own session.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_draining() {
            return Err(ChatError::connection(format!(
                "Connection {} is closing",
                self.remote_addr
            )));
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(ChatError::connection(format!(
                "Connection {} is closed",
                self.remote_addr
            ))),
            sent = self.outbound.send(data) => sent.map_err(|_| {
                ChatError::connection(format!("Writer for {} has stopped", self.remote_addr))
            }),
        }
    }

    /// Signal both the writer task and the session loop to stop now.
    ///
    /// Queued output is dropped.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Refuse further output and let the writer flush the queue, then close
    pub fn drain(&self) {
        self.draining.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// Resolves once the connection has been closed from any side
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// A freshly accepted connection, split into its parts
pub struct AcceptedConnection {
    pub handle: ConnectionHandle,
    pub reader: OwnedReadHalf,
    pub writer_task: JoinHandle<()>,
}

/// Split `stream` and start its writer task
pub fn spawn_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: &TransportConfig,
    closed: CancellationToken,
) -> AcceptedConnection {
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
    let handle = ConnectionHandle::new(remote_addr, outbound_tx, closed);

    let writer_handle = handle.clone();
    let write_timeout = config.write_timeout;
    let writer_task = tokio::spawn(async move {
        if let Err(e) = write_loop(writer, outbound_rx, &writer_handle, write_timeout).await {
            warn!(
                "Write to {} failed, closing connection: {}",
                writer_handle.remote_addr(),
                e
            );
        }
        // Any exit of the writer ends the connection; the session loop
        // notices and runs its own cleanup.
        writer_handle.close();
    });

    AcceptedConnection {
        handle,
        reader,
        writer_task,
    }
}

/// Copy the outbound queue into the socket until closed, drained or failed.
///
/// A hard close wins over pending output. Once draining starts the queue is
/// closed to new senders, so `recv` yields what is left and then `None`.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    handle: &ConnectionHandle,
    write_timeout: Duration,
) -> Result<()> {
    let mut draining = false;

    loop {
        let data = tokio::select! {
            biased;
            _ = handle.closed() => break,
            next = outbound.recv() => match next {
                Some(data) => data,
                None => break,
            },
            _ = handle.draining.cancelled(), if !draining => {
                draining = true;
                outbound.close();
                continue;
            }
        };

        match tokio::time::timeout(write_timeout, writer.write_all(&data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(ChatError::timeout(format!(
                    "Write to {} exceeded {:?}",
                    handle.remote_addr(),
                    write_timeout
                )));
            }
        }
    }

    debug!("Writer for {} stopping", handle.remote_addr());
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = ConnectionHandle::new(
            "127.0.0.1:9".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        (handle, rx)
    }

    #[tokio::test]
    async fn test_try_enqueue_full_queue_fails() {
        let (handle, mut rx) = test_handle(1);

        handle.try_enqueue(Bytes::from_static(b"one\n")).unwrap();
        let err = handle.try_enqueue(Bytes::from_static(b"two\n")).unwrap_err();
        assert!(matches!(err, ChatError::ResourceLimit(_)));

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one\n"));
    }

    #[tokio::test]
    async fn test_try_enqueue_after_close_fails() {
        let (handle, _rx) = test_handle(4);
        handle.close();
        assert!(handle.is_closed());
        assert!(handle.try_enqueue(Bytes::from_static(b"x\n")).is_err());
        assert!(handle.send(Bytes::from_static(b"x\n")).await.is_err());
    }

    #[tokio::test]
    async fn test_try_enqueue_dropped_writer_fails() {
        let (handle, rx) = test_handle(4);
        drop(rx);
        let err = handle.try_enqueue(Bytes::from_static(b"x\n")).unwrap_err();
        assert!(matches!(err, ChatError::Connection(_)));
    }

    #[tokio::test]
    async fn test_handles_compare_by_id() {
        let (a, _rx_a) = test_handle(1);
        let (b, _rx_b) = test_handle(1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_writer_task_delivers_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();

        let accepted = spawn_connection(
            server_side,
            peer,
            &TransportConfig::default(),
            CancellationToken::new(),
        );
        accepted
            .handle
            .try_enqueue(Bytes::from_static(b"first\n"))
            .unwrap();
        accepted
            .handle
            .try_enqueue(Bytes::from_static(b"second\n"))
            .unwrap();

        let mut buf = vec![0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first\nsecond\n");

        accepted.handle.close();
        accepted.writer_task.await.unwrap();
    }

    async fn loopback_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server_side, peer) = listener.accept().await.unwrap();
        (client, server_side, peer)
    }

    #[tokio::test]
    async fn test_drain_flushes_queued_output_before_eof() {
        let (mut client, server_side, peer) = loopback_pair().await;
        let accepted = spawn_connection(
            server_side,
            peer,
            &TransportConfig::default(),
            CancellationToken::new(),
        );

        for line in [&b"one\n"[..], b"two\n", b"three\n"] {
            accepted
                .handle
                .try_enqueue(Bytes::copy_from_slice(line))
                .unwrap();
        }
        accepted.handle.drain();
        assert!(
            accepted
                .handle
                .try_enqueue(Bytes::from_static(b"late\n"))
                .is_err()
        );
        assert!(
            accepted
                .handle
                .send(Bytes::from_static(b"late\n"))
                .await
                .is_err()
        );

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"one\ntwo\nthree\n");

        accepted.writer_task.await.unwrap();
        assert!(accepted.handle.is_closed());
    }

    #[tokio::test]
    async fn test_close_discards_queued_output() {
        let (mut client, server_side, peer) = loopback_pair().await;
        let accepted = spawn_connection(
            server_side,
            peer,
            &TransportConfig::default(),
            CancellationToken::new(),
        );

        accepted
            .handle
            .try_enqueue(Bytes::from_static(b"dropped\n"))
            .unwrap();
        accepted.handle.close();
        accepted.writer_task.await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_peer_hits_write_timeout() {
        // The client half is held open but never read, so the socket buffers
        // fill and a write eventually blocks.
        let (_client, server_side, peer) = loopback_pair().await;
        let (_reader, writer) = server_side.into_split();
        let (handle, rx) = {
            let (tx, rx) = mpsc::channel(64);
            (ConnectionHandle::new(peer, tx, CancellationToken::new()), rx)
        };

        let chunk = Bytes::from(vec![b'x'; 1 << 20]);
        for _ in 0..64 {
            handle.try_enqueue(chunk.clone()).unwrap();
        }

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            write_loop(writer, rx, &handle, Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ChatError::Timeout(_))));
    }
}
