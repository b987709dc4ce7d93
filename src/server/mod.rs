mod tls;
mod urls;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub use tls::{load_tls_acceptor, mozilla_server_suites, TlsError};
pub use urls::{canonical_url, host_port};

#[derive(Debug)]
pub enum ListenerError {
    // Admission ceiling reached; the caller should back off and retry.
    TooBusy,
    // The listener has been closed; no further accepts will succeed.
    Closed,
    Bind {
        address: String,
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    Tls(TlsError),
}

impl ListenerError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::TooBusy)
    }
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooBusy => write!(f, "Too many requests"),
            Self::Closed => write!(f, "Listener closed"),
            Self::Bind { address, source } => {
                write!(f, "failed to bind listener on {address}: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept connection: {source}"),
            Self::Tls(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for ListenerError {}

impl From<TlsError> for ListenerError {
    fn from(source: TlsError) -> Self {
        Self::Tls(source)
    }
}

// Admits at most `max_conns` concurrent connections and arms TCP keep-alive
// on each accepted socket. Accepted sockets are wrapped so that closing one
// returns its admission slot exactly once.
pub struct LimitListener {
    inner: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    max_conns: usize,
    keep_alive_period: Duration,
    conns: Arc<AtomicUsize>,
    closed: AtomicBool,
}

pub async fn listen(
    addr: &str,
    max_conns: usize,
    keep_alive_period: Duration,
) -> Result<LimitListener, ListenerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind {
            address: addr.to_owned(),
            source,
        })?;
    LimitListener::new(listener, max_conns, keep_alive_period)
}

pub async fn listen_tls(
    addr: &str,
    cert_file: &str,
    key_file: &str,
    max_conns: usize,
    keep_alive_period: Duration,
) -> Result<(LimitListener, TlsAcceptor), ListenerError> {
    let listener = listen(addr, max_conns, keep_alive_period).await?;
    let acceptor = load_tls_acceptor(cert_file, key_file)?;
    Ok((listener, acceptor))
}

impl LimitListener {
    pub fn new(
        listener: TcpListener,
        max_conns: usize,
        keep_alive_period: Duration,
    ) -> Result<Self, ListenerError> {
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Accept { source })?;
        Ok(Self {
            inner: tokio::sync::Mutex::new(Some(listener)),
            local_addr,
            max_conns,
            keep_alive_period,
            conns: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn conn_count(&self) -> usize {
        self.conns.load(Ordering::SeqCst)
    }

    pub async fn accept(&self) -> Result<LimitedConn, ListenerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ListenerError::Closed);
        }
        if self.conn_count() >= self.max_conns {
            // Refuse before touching the backlog; the caller backs off.
            return Err(ListenerError::TooBusy);
        }

        let guard = self.inner.lock().await;
        let Some(listener) = guard.as_ref() else {
            return Err(ListenerError::Closed);
        };
        let (stream, peer_addr) = listener
            .accept()
            .await
            .map_err(|source| ListenerError::Accept { source })?;
        drop(guard);

        self.set_keep_alive(&stream);
        self.conns.fetch_add(1, Ordering::SeqCst);
        Ok(LimitedConn::new(stream, peer_addr, Arc::clone(&self.conns)))
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.lock().await.take();
        }
    }

    fn set_keep_alive(&self, stream: &TcpStream) {
        if self.keep_alive_period.is_zero() {
            return;
        }
        let keep_alive = TcpKeepalive::new().with_time(self.keep_alive_period);
        let _ = SockRef::from(stream).set_tcp_keepalive(&keep_alive);
    }
}

// Returns the admission slot exactly once, whether the connection is
// released explicitly, shut down, or just dropped.
#[derive(Debug)]
struct AdmissionSlot {
    conns: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl AdmissionSlot {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.conns.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
pub struct LimitedConn {
    stream: TcpStream,
    peer_addr: SocketAddr,
    slot: AdmissionSlot,
}

impl LimitedConn {
    fn new(stream: TcpStream, peer_addr: SocketAddr, conns: Arc<AtomicUsize>) -> Self {
        Self {
            stream,
            peer_addr,
            slot: AdmissionSlot {
                conns,
                released: AtomicBool::new(false),
            },
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    // Safe to call any number of times.
    pub fn release(&self) {
        self.slot.release();
    }
}

impl AsyncRead for LimitedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LimitedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_shutdown(cx) {
            Poll::Ready(result) => {
                this.slot.release();
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
