//! TCP listener that serves one connection at a time.
//!
//! The accept loop awaits each connection to completion before accepting
//! the next one, so peers that connect while a connection is being served
//! wait in the kernel backlog. Every chunk read from the peer is decoded
//! as UTF-8 and written to the output sink followed by a newline.
//!
//! Per-connection failures (read errors, invalid UTF-8, idle timeouts)
//! close that connection only; the listener keeps accepting. Failing to
//! bind, or failing to write to the output, is fatal.

use crate::config::Config;
use crate::decoder::{DecodePolicy, Utf8Decoder};
use crate::error::ListenerError;
use bytes::BytesMut;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

/// Settings applied to every accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Maximum bytes read per chunk.
    pub buffer_size: usize,
    /// Close the connection if no data arrives within this long.
    pub read_timeout: Option<Duration>,
    pub decode: DecodePolicy,
}

impl From<&Config> for ConnectionOptions {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            read_timeout: config.read_timeout,
            decode: config.decode,
        }
    }
}

/// Why a connection stopped being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Zero-length read: orderly shutdown by the peer.
    PeerClosed,
    ReadError,
    DecodeError,
    TimedOut,
}

/// What happened on one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub peer: SocketAddr,
    pub chunks: u64,
    pub bytes: u64,
    pub reason: Disconnect,
}

/// The listening socket plus the options used to serve connections.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    options: ConnectionOptions,
}

impl Listener {
    /// Bind and start listening on the configured host and port.
    pub async fn bind(config: &Config) -> Result<Self, ListenerError> {
        let listen = config.listen_addr();
        let bind_err = |source: io::Error| ListenerError::Bind {
            addr: listen.clone(),
            source,
        };

        let addr = tokio::net::lookup_host(listen.as_str())
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "host resolved to no addresses",
                ))
            })?;

        let std_listener = create_listener(addr, config.backlog).map_err(bind_err)?;
        let inner = TcpListener::from_std(std_listener).map_err(bind_err)?;
        let local_addr = inner.local_addr().map_err(bind_err)?;

        info!(
            address = %local_addr,
            port = local_addr.port(),
            backlog = config.backlog,
            "Listening on port {}",
            local_addr.port()
        );

        Ok(Self {
            inner,
            local_addr,
            options: ConnectionOptions::from(config),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve connections forever.
    ///
    /// Only returns on a fatal error.
    pub async fn run<W>(self, mut sink: W) -> Result<Infallible, ListenerError>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            match self.serve_next(&mut sink).await {
                Ok(summary) => {
                    debug!(
                        peer = %summary.peer,
                        chunks = summary.chunks,
                        bytes = summary.bytes,
                        reason = ?summary.reason,
                        "Ready for next connection"
                    );
                }
                Err(ListenerError::Accept(e)) => {
                    error!(error = %e, "Failed to accept connection");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Accept a single connection and serve it until it ends.
    pub async fn serve_next<W>(&self, sink: &mut W) -> Result<ConnectionSummary, ListenerError>
    where
        W: AsyncWrite + Unpin,
    {
        let (stream, peer) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        info!(peer = %peer, "Connection established from {}", peer);

        serve_connection(stream, peer, &self.options, sink).await
    }
}

/// Read chunks from `stream` and write their text to `sink` until the peer
/// closes the connection or the connection fails.
///
/// The stream is owned here and dropped on every return path.
pub async fn serve_connection<S, W>(
    mut stream: S,
    peer: SocketAddr,
    options: &ConnectionOptions,
    sink: &mut W,
) -> Result<ConnectionSummary, ListenerError>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::zeroed(options.buffer_size);
    let mut decoder = Utf8Decoder::new(options.decode);
    let mut chunks = 0u64;
    let mut bytes = 0u64;

    let reason = loop {
        let read = match options.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.read(&mut buffer)).await {
                Ok(read) => read,
                Err(_) => {
                    warn!(peer = %peer, timeout = ?limit, "Read timed out, closing connection");
                    break Disconnect::TimedOut;
                }
            },
            None => stream.read(&mut buffer).await,
        };

        match read {
            Ok(0) => match decoder.finish() {
                Ok(text) => {
                    emit(sink, &text).await?;
                    break Disconnect::PeerClosed;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Connection closed mid-character");
                    break Disconnect::DecodeError;
                }
            },
            Ok(n) => {
                chunks += 1;
                bytes += n as u64;

                match decoder.decode(&buffer[..n]) {
                    Ok(text) => {
                        trace!(peer = %peer, bytes = n, pending = decoder.pending(), "Chunk received");
                        emit(sink, &text).await?;
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Invalid UTF-8, closing connection");
                        break Disconnect::DecodeError;
                    }
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Read error, closing connection");
                break Disconnect::ReadError;
            }
        }
    };

    info!(peer = %peer, chunks, bytes, reason = ?reason, "Connection closed");

    Ok(ConnectionSummary {
        peer,
        chunks,
        bytes,
        reason,
    })
}

/// Write one decoded chunk as a line.
async fn emit<W>(sink: &mut W, text: &str) -> Result<(), ListenerError>
where
    W: AsyncWrite + Unpin,
{
    if text.is_empty() {
        return Ok(());
    }

    sink.write_all(text.as_bytes())
        .await
        .map_err(ListenerError::Output)?;
    sink.write_all(b"\n").await.map_err(ListenerError::Output)?;
    sink.flush().await.map_err(ListenerError::Output)
}

/// Create a non-blocking listening socket with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    fn test_peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn send_and_close(addr: SocketAddr, data: &[u8]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(data).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_connection_mock_chunks() {
        let stream = tokio_test::io::Builder::new()
            .read(b"first")
            .read(b"second")
            .build();
        let options = ConnectionOptions::from(&Config::default());
        let mut out = Vec::new();

        let summary = serve_connection(stream, test_peer(), &options, &mut out)
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "first\nsecond\n");
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.bytes, 11);
        assert_eq!(summary.reason, Disconnect::PeerClosed);
    }

    #[tokio::test]
    async fn test_serve_connection_read_error() {
        let stream = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let options = ConnectionOptions::from(&Config::default());
        let mut out = Vec::new();

        let summary = serve_connection(stream, test_peer(), &options, &mut out)
            .await
            .unwrap();

        assert_eq!(out, b"partial\n");
        assert_eq!(summary.reason, Disconnect::ReadError);
    }

    #[tokio::test]
    async fn test_serve_connection_split_character() {
        let stream = tokio_test::io::Builder::new()
            .read(b"caf\xc3")
            .read(b"\xa9")
            .build();
        let options = ConnectionOptions::from(&Config::default());
        let mut out = Vec::new();

        serve_connection(stream, test_peer(), &options, &mut out)
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "caf\né\n");
    }

    #[tokio::test]
    async fn test_serve_connection_respects_buffer_size() {
        let stream = tokio_test::io::Builder::new().read(b"abcdefgh").build();
        let options = ConnectionOptions {
            buffer_size: 3,
            ..ConnectionOptions::from(&Config::default())
        };
        let mut out = Vec::new();

        let summary = serve_connection(stream, test_peer(), &options, &mut out)
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "abc\ndef\ngh\n");
        assert_eq!(summary.chunks, 3);
    }

    #[tokio::test]
    async fn test_serve_connection_strict_and_lossy() {
        let strict = ConnectionOptions::from(&Config::default());
        let stream = tokio_test::io::Builder::new()
            .read(b"good")
            .read(b"bad\xff")
            .build();
        let mut out = Vec::new();
        let summary = serve_connection(stream, test_peer(), &strict, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"good\n");
        assert_eq!(summary.reason, Disconnect::DecodeError);

        let lossy = ConnectionOptions {
            decode: DecodePolicy::Lossy,
            ..strict
        };
        let stream = tokio_test::io::Builder::new()
            .read(b"bad\xff")
            .read(b"more")
            .build();
        let mut out = Vec::new();
        let summary = serve_connection(stream, test_peer(), &lossy, &mut out)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "bad\u{FFFD}\nmore\n");
        assert_eq!(summary.reason, Disconnect::PeerClosed);
    }

    #[tokio::test]
    async fn test_hello_is_printed() {
        let listener = Listener::bind(&test_config()).await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move { send_and_close(addr, b"hello\n").await });

        let mut out = Vec::new();
        let summary = listener.serve_next(&mut out).await.unwrap();
        client.await.unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "hello\n\n");
        assert_eq!(summary.bytes, 6);
        assert_eq!(summary.reason, Disconnect::PeerClosed);
    }

    #[tokio::test]
    async fn test_chunks_keep_their_order() {
        let listener = Listener::bind(&test_config()).await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            for part in ["alpha ", "beta ", "gamma"] {
                stream.write_all(part.as_bytes()).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let mut out = Vec::new();
        listener.serve_next(&mut out).await.unwrap();
        client.await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let alpha = text.find("alpha").unwrap();
        let beta = text.find("beta").unwrap();
        let gamma = text.find("gamma").unwrap();
        assert!(alpha < beta && beta < gamma);
    }

    #[tokio::test]
    async fn test_empty_connection_prints_nothing() {
        let listener = Listener::bind(&test_config()).await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            drop(stream);
        });

        let mut out = Vec::new();
        let summary = listener.serve_next(&mut out).await.unwrap();
        client.await.unwrap();

        assert!(out.is_empty());
        assert_eq!(summary.chunks, 0);
        assert_eq!(summary.bytes, 0);
        assert_eq!(summary.reason, Disconnect::PeerClosed);
    }

    #[tokio::test]
    async fn test_sequential_connections_are_not_mixed() {
        let listener = Listener::bind(&test_config()).await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            send_and_close(addr, b"from one").await;
            send_and_close(addr, b"from two").await;
        });

        let mut first = Vec::new();
        let summary_one = listener.serve_next(&mut first).await.unwrap();
        let mut second = Vec::new();
        let summary_two = listener.serve_next(&mut second).await.unwrap();
        client.await.unwrap();

        assert_eq!(String::from_utf8(first).unwrap(), "from one\n");
        assert_eq!(String::from_utf8(second).unwrap(), "from two\n");
        assert_ne!(summary_one.peer, summary_two.peer);
    }

    #[tokio::test]
    async fn test_invalid_utf8_only_ends_that_connection() {
        let listener = Listener::bind(&test_config()).await.unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            send_and_close(addr, b"\xff\xfe").await;
            send_and_close(addr, b"still here").await;
        });

        let mut first = Vec::new();
        let summary = listener.serve_next(&mut first).await.unwrap();
        assert_eq!(summary.reason, Disconnect::DecodeError);
        assert!(first.is_empty());

        let mut second = Vec::new();
        listener.serve_next(&mut second).await.unwrap();
        client.await.unwrap();

        assert_eq!(String::from_utf8(second).unwrap(), "still here\n");
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let config = Config {
            read_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        };
        let listener = Listener::bind(&config).await.unwrap();
        let addr = listener.local_addr();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let client = tokio::spawn(async move {
            let _stream = TcpStream::connect(addr).await.unwrap();
            let _ = done_rx.await;
        });

        let mut out = Vec::new();
        let summary = listener.serve_next(&mut out).await.unwrap();
        done_tx.send(()).unwrap();
        client.await.unwrap();

        assert_eq!(summary.reason, Disconnect::TimedOut);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_bind_fails_when_port_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        };

        match Listener::bind(&config).await {
            Err(ListenerError::Bind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("bind should fail on a port in use"),
        }
    }

    #[tokio::test]
    async fn test_run_keeps_accepting() {
        let listener = Listener::bind(&test_config()).await.unwrap();
        let addr = listener.local_addr();
        let (writer, mut reader) = tokio::io::duplex(4096);

        let server = tokio::spawn(listener.run(writer));

        send_and_close(addr, b"one").await;
        send_and_close(addr, b"\xc3(").await;
        send_and_close(addr, b"three").await;

        let expected = "one\nthree\n";
        let mut out = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut out))
            .await
            .unwrap()
            .unwrap();
        server.abort();

        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }
}
