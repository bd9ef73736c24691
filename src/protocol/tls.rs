//! TLS 1.3 over TCP, backed by `rustls`.
//!
//! A [`TlsStream`] and all of its clones share one `rustls` session, so the writer and the
//! receive loop of a connection can sit on different threads just as they do with a plain
//! socket. Each clone reads and writes through its own socket handle and only takes the
//! session lock to move records in and out of it, never across a blocking read.
use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::debug;
use rustls::{
    ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
};

use super::Stream;

const READ_CHUNK: usize = 16 * 1024;

/// How a client verifies the server it connects to.
#[derive(Clone)]
pub struct TlsOptions {
    config: Arc<rustls::ClientConfig>,
    server_name: Option<String>,
}

impl TlsOptions {
    pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            config,
            server_name: None,
        }
    }

    /// Trusts the Mozilla root set shipped with `webpki-roots`.
    pub fn webpki_roots() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    /// Trusts only the PEM certificates in `pem`, such as a private CA or a
    /// self-signed server certificate.
    pub fn from_pem(pem: &[u8]) -> io::Result<Self> {
        let mut roots = RootCertStore::empty();
        for certificate in load_certificates(pem)? {
            roots.add(certificate).map_err(io::Error::other)?;
        }
        Ok(Self::with_roots(roots))
    }

    /// Name checked against the server certificate; defaults to the host connected to.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn with_roots(roots: RootCertStore) -> Self {
        let config =
            rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .with_root_certificates(roots)
                .with_no_client_auth();
        Self::new(Arc::new(config))
    }
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Parses every certificate in a PEM bundle.
pub fn load_certificates(pem: &[u8]) -> io::Result<Vec<CertificateDer<'static>>> {
    let certificates = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certificates.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates found in PEM input",
        ));
    }
    Ok(certificates)
}

/// Parses the first private key in a PEM file.
pub fn load_private_key(pem: &[u8]) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "no private key found in PEM input",
        )
    })
}

/// TLS 1.3 server configuration presenting `certificates`.
pub fn server_config(
    certificates: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> io::Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certificates, key)
        .map_err(io::Error::other)?;
    Ok(Arc::new(config))
}

pub struct TlsStream {
    session: Arc<Mutex<Connection>>,
    socket: TcpStream,
    /// Records read from `socket` that the session has not taken yet.
    incoming: Vec<u8>,
}

impl TlsStream {
    /// Runs the client side of the handshake, bounded by `timeout`.
    pub fn connect(
        socket: TcpStream,
        options: &TlsOptions,
        host: &str,
        timeout: Duration,
    ) -> io::Result<Self> {
        let name = options.server_name.as_deref().unwrap_or(host);
        let name = ServerName::try_from(name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let session =
            ClientConnection::new(Arc::clone(&options.config), name).map_err(io::Error::other)?;
        Self::handshake(socket, session.into(), timeout)
    }

    /// Runs the server side of the handshake, bounded by `timeout`.
    pub fn accept(
        socket: TcpStream,
        config: Arc<ServerConfig>,
        timeout: Duration,
    ) -> io::Result<Self> {
        let session = ServerConnection::new(config).map_err(io::Error::other)?;
        Self::handshake(socket, session.into(), timeout)
    }

    fn handshake(
        mut socket: TcpStream,
        mut session: Connection,
        timeout: Duration,
    ) -> io::Result<Self> {
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;
        while session.is_handshaking() {
            session.complete_io(&mut socket)?;
        }
        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;

        debug!(
            "TLS session established with {:?} ({:?})",
            socket.peer_addr().ok(),
            session.protocol_version()
        );
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            socket,
            incoming: Vec::new(),
        })
    }
}

fn lock(session: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn invalid_data(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Writes out every record the session has queued.
fn send_pending(session: &mut Connection, socket: &mut TcpStream) -> io::Result<()> {
    while session.wants_write() {
        session.write_tls(socket)?;
    }
    Ok(())
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut session = lock(&self.session);
                match session.reader().read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    result => return result,
                }

                if !self.incoming.is_empty() {
                    let consumed = session.read_tls(&mut self.incoming.as_slice())?;
                    self.incoming.drain(..consumed);
                    session.process_new_packets().map_err(invalid_data)?;
                    send_pending(&mut session, &mut self.socket)?;
                    continue;
                }
            }

            let mut chunk = [0_u8; READ_CHUNK];
            let n = self.socket.read(&mut chunk)?;
            if n == 0 {
                let mut session = lock(&self.session);
                session.read_tls(&mut io::empty())?;
                session.process_new_packets().map_err(invalid_data)?;
                // Ok(0) after close_notify, UnexpectedEof otherwise.
                return match session.reader().read(buf) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    result => result,
                };
            }
            self.incoming.extend_from_slice(&chunk[..n]);
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut session = lock(&self.session);
        let n = session.writer().write(buf)?;
        send_pending(&mut session, &mut self.socket)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut session = lock(&self.session);
        session.writer().flush()?;
        send_pending(&mut session, &mut self.socket)
    }
}

impl Stream for TlsStream {
    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            session: Arc::clone(&self.session),
            socket: self.socket.try_clone()?,
            incoming: Vec::new(),
        })
    }

    fn shutdown(&self) -> io::Result<()> {
        self.socket.shutdown(Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_write_timeout(timeout)
    }
}

impl fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStream")
            .field("peer", &self.socket.peer_addr().ok())
            .finish_non_exhaustive()
    }
}
