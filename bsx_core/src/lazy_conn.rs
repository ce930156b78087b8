//! Lazy Connection
//!
//! A byte stream to beanstalkd that connects on first use and reconnects on
//! the next read or write after the peer went away. It never retries on its
//! own: a failed dial is reported to the caller straight away and the retry
//! policy lives in the scrape loop.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Something that can open a fresh stream to the server.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self) -> io::Result<Self::Stream>;

    /// Address of the peer, used for logging and the `instance` label.
    fn address(&self) -> &str;
}

/// TCP dialer with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", self.address, self.timeout),
                )
            })??;

        stream.set_nodelay(true)?;

        tracing::debug!(
            local = ?stream.local_addr().ok(),
            peer = %self.address,
            "TCP connection established"
        );

        Ok(stream)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Whether the connection currently holds a live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Errors after which the stream can no longer be trusted.
///
/// A timed out read is included: the reply may still arrive later and would
/// be taken as the answer to the next request.
fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}

/// Lazily (re)connecting stream.
pub struct LazyConn<D: Dialer> {
    dialer: D,
    stream: Option<D::Stream>,
    read_timeout: Option<Duration>,
}

impl<D: Dialer> LazyConn<D> {
    /// Create a disconnected stream; the first read or write dials.
    pub fn new(dialer: D, read_timeout: Option<Duration>) -> Self {
        Self {
            dialer,
            stream: None,
            read_timeout,
        }
    }

    /// Create a stream and dial right away.
    pub async fn open(dialer: D, read_timeout: Option<Duration>) -> io::Result<Self> {
        let mut conn = Self::new(dialer, read_timeout);
        conn.connect().await?;
        Ok(conn)
    }

    pub fn address(&self) -> &str {
        self.dialer.address()
    }

    pub fn state(&self) -> ConnectionState {
        if self.stream.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Dial a new stream, replacing the current one if any.
    pub async fn connect(&mut self) -> io::Result<()> {
        self.stream = None;
        match self.dialer.dial().await {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(address = %self.dialer.address(), error = %e, "unable to connect");
                Err(e)
            }
        }
    }

    /// Dial only if there is no live stream.
    pub async fn ensure_connected(&mut self) -> io::Result<()> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    async fn live_stream(&mut self, failure: io::ErrorKind) -> io::Result<&mut D::Stream> {
        if self.stream.is_none() {
            self.connect()
                .await
                .map_err(|e| io::Error::new(failure, e))?;
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(failure))
    }

    fn disconnect(&mut self, reason: &str) {
        if self.stream.take().is_some() {
            tracing::debug!(address = %self.dialer.address(), reason, "dropping connection");
        }
    }

    /// Read into `buf`. End of stream (`Ok(0)`) marks the connection as lost.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read_timeout = self.read_timeout;
        let stream = self.live_stream(io::ErrorKind::UnexpectedEof).await?;

        let result = match read_timeout {
            Some(limit) if !limit.is_zero() => {
                match tokio::time::timeout(limit, stream.read(buf)).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
                }
            }
            _ => stream.read(buf).await,
        };

        match &result {
            Ok(0) if !buf.is_empty() => self.disconnect("end of stream"),
            Err(e) if is_fatal(e) => self.disconnect("read failed"),
            _ => {}
        }
        result
    }

    /// Write part of `buf`. A write that moves no bytes drops the stream
    /// since the peer may have seen a partial frame.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.live_stream(io::ErrorKind::BrokenPipe).await?;
        let result = stream.write(buf).await;

        match &result {
            Ok(0) if !buf.is_empty() => self.disconnect("zero-length write"),
            Err(_) => self.disconnect("write failed"),
            _ => {}
        }
        result
    }

    /// Write the whole frame. Stops at the first failed write; the next
    /// call starts over on a fresh connection.
    pub async fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                n => buf = &buf[n..],
            }
        }
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = stream.flush().await {
                self.disconnect("flush failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release the stream. A no-op when already disconnected.
    pub async fn close(&mut self) -> io::Result<()> {
        if let Some(mut stream) = self.stream.take() {
            match stream.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
            tracing::debug!(address = %self.dialer.address(), "connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Dialer handing the server side of an in-memory pipe to the test.
    pub(crate) struct PipeDialer {
        pub dials: Arc<AtomicUsize>,
        pub refuse: Arc<AtomicBool>,
        accepted: mpsc::UnboundedSender<DuplexStream>,
    }

    impl PipeDialer {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let dialer = Self {
                dials: Arc::new(AtomicUsize::new(0)),
                refuse: Arc::new(AtomicBool::new(false)),
                accepted: tx,
            };
            (dialer, rx)
        }
    }

    #[async_trait]
    impl Dialer for PipeDialer {
        type Stream = DuplexStream;

        async fn dial(&self) -> io::Result<DuplexStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            let (client, server) = tokio::io::duplex(4096);
            self.accepted
                .send(server)
                .map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
            Ok(client)
        }

        fn address(&self) -> &str {
            "pipe"
        }
    }

    #[tokio::test]
    async fn test_starts_disconnected_and_dials_on_write() {
        let (dialer, mut accepted) = PipeDialer::new();
        let dials = dialer.dials.clone();
        let mut conn = LazyConn::new(dialer, None);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(dials.load(Ordering::SeqCst), 0);

        conn.write_all(b"stats\r\n").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let mut server = accepted.recv().await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"stats\r\n");
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream_reconnects_on_next_call() {
        let (dialer, mut accepted) = PipeDialer::new();
        let dials = dialer.dials.clone();
        let mut conn = LazyConn::open(dialer, None).await.unwrap();

        // Peer hangs up.
        drop(accepted.recv().await.unwrap());

        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.write_all(b"list-tubes\r\n").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(dials.load(Ordering::SeqCst), 2);

        let mut server = accepted.recv().await.unwrap();
        server.write_all(b"OK 0\r\n").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK 0\r\n");
    }

    #[tokio::test]
    async fn test_dial_failure_is_not_retried() {
        let (dialer, _accepted) = PipeDialer::new();
        dialer.refuse.store(true, Ordering::SeqCst);
        let dials = dialer.dials.clone();
        let mut conn = LazyConn::new(dialer, None);

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        let err = conn.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_drops_stream() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut conn = LazyConn::open(dialer, None).await.unwrap();
        drop(accepted.recv().await.unwrap());

        assert!(conn.write(b"stats\r\n").await.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_when_disconnected_is_noop() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut conn = LazyConn::new(dialer, None);
        conn.close().await.unwrap();

        conn.ensure_connected().await.unwrap();
        let _server = accepted.recv().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_drops_stream() {
        let (dialer, mut accepted) = PipeDialer::new();
        let mut conn = LazyConn::open(dialer, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        let _server = accepted.recv().await.unwrap();

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_tcp_reconnect_after_server_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: hang up immediately.
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            // Second connection: answer one line.
            let (mut second, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 7];
            second.read_exact(&mut buf).await.unwrap();
            second.write_all(b"OK 0\r\n").await.unwrap();
        });

        let dialer = TcpDialer::new(addr.to_string(), Duration::from_secs(1));
        let mut conn = LazyConn::open(dialer, Some(Duration::from_secs(2)))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let first = conn.read(&mut buf).await;
        assert!(matches!(first, Ok(0)) || first.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.write_all(b"stats\r\n").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OK 0\r\n");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = TcpDialer::new(addr.to_string(), Duration::from_millis(500));
        assert!(LazyConn::open(dialer, None).await.is_err());
    }
}
