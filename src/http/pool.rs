//! Socket pool and TLS session establishment
//!
//! Connections to the (proxy-aware) destination are pooled per client.
//! A transaction acquires a descriptor, uses it, and releases it with a
//! close state: `NoClose` returns the connection for reuse, `NormalClose`
//! and `ErrorClose` discard it.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;

use tracing::debug;

/// How a transaction releases its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCloseState {
    /// Healthy transaction on a reusable connection.
    NoClose,
    /// Healthy transaction, but the connection must not be reused
    /// (`Connection: close`, or reuse disabled).
    NormalClose,
    /// The transaction failed; the socket state is unknown.
    ErrorClose,
}

/// Plain or TLS-wrapped connection.
enum Conn {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Conn {
    fn tcp(&self) -> &TcpStream {
        match self {
            Conn::Plain(stream) => stream,
            Conn::Tls(stream) => stream.get_ref(),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Plain(stream) => stream.read(buf),
            Conn::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Plain(stream) => stream.write(buf),
            Conn::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Plain(stream) => stream.flush(),
            Conn::Tls(stream) => stream.flush(),
        }
    }
}

/// A pooled connection handed to one transaction at a time.
pub struct Descriptor {
    conn: Conn,
    /// Whether this descriptor reuses an earlier connection.
    pub reused: bool,
}

impl Descriptor {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.conn.tcp().set_read_timeout(timeout)
    }
}

impl Read for Descriptor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.read(buf)
    }
}

impl Write for Descriptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}

fn ensure_crypto_provider_installed() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

struct TlsSetup {
    config: Arc<rustls::ClientConfig>,
    server_name: rustls::pki_types::ServerName<'static>,
}

/// Pool of connections to one destination.
pub struct SocketPool {
    host: String,
    port: u16,
    connect_timeout: Duration,
    tls: Option<TlsSetup>,
    idle: Mutex<VecDeque<Conn>>,
}

impl SocketPool {
    /// Build a pool for `host:port`. When `tls_server_name` is set, new
    /// connections are wrapped in a TLS session; roots come from the given
    /// PEM sources.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        tls_server_name: Option<&str>,
        extra_cert_file: Option<&PathBuf>,
        extra_cert_data: &str,
    ) -> io::Result<Self> {
        let tls = match tls_server_name {
            Some(name) => Some(build_tls_setup(name, extra_cert_file, extra_cert_data)?),
            None => None,
        };
        Ok(Self {
            host: host.into(),
            port,
            connect_timeout,
            tls,
            idle: Mutex::new(VecDeque::new()),
        })
    }

    /// Take an idle connection or establish a new one.
    pub fn acquire(&self) -> io::Result<Descriptor> {
        if let Some(conn) = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            debug!(host = %self.host, "reusing pooled connection");
            return Ok(Descriptor { conn, reused: true });
        }

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}:{}", self.host, self.port),
                )
            })?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;

        let conn = match &self.tls {
            Some(setup) => {
                let session =
                    rustls::ClientConnection::new(setup.config.clone(), setup.server_name.clone())
                        .map_err(|e| {
                            io::Error::new(io::ErrorKind::InvalidInput, format!("tls: {}", e))
                        })?;
                Conn::Tls(Box::new(rustls::StreamOwned::new(session, stream)))
            }
            None => Conn::Plain(stream),
        };
        Ok(Descriptor { conn, reused: false })
    }

    /// Return a descriptor. Only `NoClose` keeps the connection around.
    pub fn release(&self, descriptor: Descriptor, close_state: ConnectionCloseState) {
        match close_state {
            ConnectionCloseState::NoClose => {
                // Clear any per-transaction read timeout before pooling.
                let _ = descriptor.set_read_timeout(None);
                self.idle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(descriptor.conn);
            }
            ConnectionCloseState::NormalClose | ConnectionCloseState::ErrorClose => {
                drop(descriptor);
            }
        }
    }

    pub fn num_idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn build_tls_setup(
    server_name: &str,
    extra_cert_file: Option<&PathBuf>,
    extra_cert_data: &str,
) -> io::Result<TlsSetup> {
    ensure_crypto_provider_installed();

    let mut roots = rustls::RootCertStore::empty();
    let mut loaded = 0usize;
    if let Some(path) = extra_cert_file {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert?;
            roots
                .add(cert)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("cert: {}", e)))?;
            loaded += 1;
        }
    }
    if !extra_cert_data.is_empty() {
        let mut reader = BufReader::new(extra_cert_data.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert?;
            roots
                .add(cert)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("cert: {}", e)))?;
            loaded += 1;
        }
    }
    if loaded == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TLS enabled but no root certificates configured",
        ));
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TLS server name {:?}", server_name),
            )
        })?;

    Ok(TlsSetup {
        config: Arc::new(config),
        server_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_acquire_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let pool = SocketPool::new(
            "127.0.0.1",
            port,
            Duration::from_secs(5),
            None,
            None,
            "",
        )
        .unwrap();

        let descriptor = pool.acquire().unwrap();
        assert!(!descriptor.reused);
        pool.release(descriptor, ConnectionCloseState::NoClose);
        assert_eq!(pool.num_idle(), 1);

        let descriptor = pool.acquire().unwrap();
        assert!(descriptor.reused);
        pool.release(descriptor, ConnectionCloseState::NormalClose);
        assert_eq!(pool.num_idle(), 0);
    }

    #[test]
    fn test_connect_failure() {
        // Port 1 on localhost is almost certainly closed.
        let pool = SocketPool::new(
            "127.0.0.1",
            1,
            Duration::from_millis(200),
            None,
            None,
            "",
        )
        .unwrap();
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn test_error_close_discards() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pool = SocketPool::new(
            "127.0.0.1",
            port,
            Duration::from_secs(5),
            None,
            None,
            "",
        )
        .unwrap();

        let descriptor = pool.acquire().unwrap();
        pool.release(descriptor, ConnectionCloseState::ErrorClose);
        assert_eq!(pool.num_idle(), 0);
    }

    #[test]
    fn test_tls_requires_roots() {
        let result = SocketPool::new(
            "example.com",
            443,
            Duration::from_secs(5),
            Some("example.com"),
            None,
            "",
        );
        assert!(result.is_err());
    }
}
