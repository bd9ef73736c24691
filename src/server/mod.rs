//! A mock MaazDB server.
//!
//! Speaks the same wire protocol as a real server: it authenticates the first frame of each
//! connection against a fixed user list, then executes the toy dialect described in
//! [`statement`] against an in-memory [`Catalog`]. Each connection is served by one worker of
//! a [`ThreadPool`] and answers commands in the order it reads them. While every worker is
//! busy, new connections get a `server busy` protocol error in reply to their handshake.
//!
//! [`MockServer::with_tls`] wraps every accepted socket in TLS before the handshake.
//!
//! It exists for tests, demos and the `maazdb_server` binary; nothing is persisted.
mod engine;
pub mod statement;
mod thread;

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};
use rustls::ServerConfig;
use thiserror::Error;

use crate::protocol::{
    ErrorCode, NetworkStream, ProtocolTransport, Reply, Request, Response, Stream, TlsStream,
    TransportError,
};

pub use engine::{Catalog, DEFAULT_DATABASE, EngineError, Session};
pub use statement::{Statement, StatementError};
use thread::ThreadPool;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct MockServer {
    listener: TcpListener,
    users: Arc<HashMap<String, String>>,
    catalog: Arc<Mutex<Catalog>>,
    pool: ThreadPool,
    tls: Option<Arc<ServerConfig>>,
    /// Connections currently owned by a worker.
    active: Arc<AtomicUsize>,
}

impl MockServer {
    /// Binds `address`; port 0 picks a free port, see [`MockServer::local_addr`].
    pub fn bind<I>(address: SocketAddr, users: I, workers: usize) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            users: Arc::new(users.into_iter().collect()),
            catalog: Arc::new(Mutex::new(Catalog::default())),
            pool: ThreadPool::new(workers),
            tls: None,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Serves every connection over TLS with `config`.
    pub fn with_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the listener fails.
    pub fn listen(self) -> Result<(), ServerError> {
        info!(
            "listening at {} with {} workers{}",
            self.local_addr()?,
            self.pool.size(),
            if self.tls.is_some() { " over TLS" } else { "" }
        );

        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("broken connection: {e:?}");
                    continue;
                }
            };
            let tls = self.tls.clone();

            // Only this loop increments, so the count cannot grow past the check.
            if self.active.load(Ordering::SeqCst) >= self.pool.size() {
                std::thread::spawn(move || {
                    let peer = stream.peer_addr().ok();
                    info!("all workers busy; refusing {peer:?}");
                    if let Err(e) = refuse_connection(stream, tls) {
                        debug!("refusing {peer:?} failed: {e}");
                    }
                });
                continue;
            }

            let slot = ActiveSlot::take(&self.active);
            let users = Arc::clone(&self.users);
            let catalog = Arc::clone(&self.catalog);
            self.pool.execute(move || {
                let _slot = slot;
                let peer = stream.peer_addr().ok();
                if let Err(e) = serve(stream, tls, users, catalog) {
                    warn!("connection from {peer:?} failed: {e}");
                }
            });
        }
        Ok(())
    }
}

/// Holds one unit of [`MockServer::active`] until dropped.
struct ActiveSlot(Arc<AtomicUsize>);

impl ActiveSlot {
    fn take(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(active))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn accept_stream(
    stream: TcpStream,
    tls: Option<Arc<ServerConfig>>,
) -> Result<NetworkStream, ServerError> {
    Ok(match tls {
        Some(config) => NetworkStream::Tls(TlsStream::accept(stream, config, HANDSHAKE_TIMEOUT)?),
        None => NetworkStream::Plain(stream),
    })
}

fn serve(
    stream: TcpStream,
    tls: Option<Arc<ServerConfig>>,
    users: Arc<HashMap<String, String>>,
    catalog: Arc<Mutex<Catalog>>,
) -> Result<(), ServerError> {
    let stream = accept_stream(stream, tls)?;
    Ok(handle_connection(stream, users, catalog)?)
}

/// Answers the opening frame with `server busy` and hangs up.
fn refuse_connection(
    stream: TcpStream,
    tls: Option<Arc<ServerConfig>>,
) -> Result<(), ServerError> {
    let stream = accept_stream(stream, tls)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let mut transport = ProtocolTransport::new(stream);
    let hello = transport.read_command()?;
    transport.write_reply(&Reply::new(
        hello.id,
        error(ErrorCode::Protocol, "server busy"),
    ))?;
    Ok(())
}

fn error(code: ErrorCode, message: impl Into<String>) -> Response {
    Response::Error {
        code,
        message: message.into(),
    }
}

fn handle_connection<S: Read + Write>(
    stream: S,
    users: Arc<HashMap<String, String>>,
    catalog: Arc<Mutex<Catalog>>,
) -> Result<(), TransportError> {
    let mut transport = ProtocolTransport::new(stream);

    let hello = transport.read_command()?;
    let Request::Handshake { user, password } = &hello.request else {
        transport.write_reply(&Reply::new(
            hello.id,
            error(ErrorCode::Protocol, "expected a handshake"),
        ))?;
        return Ok(());
    };

    if users.get(user) != Some(password) {
        info!("rejected credentials for user '{user}'");
        transport.write_reply(&Reply::new(
            hello.id,
            error(
                ErrorCode::Authentication,
                format!("invalid credentials for user '{user}'"),
            ),
        ))?;
        return Ok(());
    }
    transport.write_reply(&Reply::new(hello.id, Response::HandshakeAccepted))?;
    info!("user '{user}' authenticated");

    let mut session = Session::new(catalog);
    loop {
        let command = match transport.read_command() {
            Ok(command) => command,
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        debug!("received command #{}: {:?}", command.id, command.request);

        let response = match &command.request {
            Request::Terminate => return Ok(()),
            Request::Handshake { .. } => error(ErrorCode::Protocol, "already authenticated"),
            Request::Query { text } => session.execute(text),
        };

        transport.write_reply(&Reply::new(command.id, response))?;
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::protocol::Command;

    use super::*;

    fn spawn_server_with(workers: usize) -> SocketAddr {
        let server = MockServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            [("admin".to_string(), "admin".to_string())],
            workers,
        )
        .unwrap();
        let address = server.local_addr().unwrap();
        thread::spawn(move || server.listen());
        address
    }

    fn spawn_server() -> SocketAddr {
        spawn_server_with(2)
    }

    fn handshake(address: SocketAddr, password: &str) -> (ProtocolTransport<TcpStream>, Reply) {
        let mut transport = ProtocolTransport::new(TcpStream::connect(address).unwrap());
        transport
            .write_command(&Command::handshake("admin", password))
            .unwrap();
        let reply = transport.read_reply().unwrap();
        (transport, reply)
    }

    #[test]
    fn replies_carry_command_ids() {
        let (mut transport, reply) = handshake(spawn_server(), "admin");
        assert_eq!(reply.response, Response::HandshakeAccepted);

        transport
            .write_command(&Command::query(41, "CREATE TABLE t (id SERIAL);"))
            .unwrap();
        transport
            .write_command(&Command::query(42, "SELECT * FROM t;"))
            .unwrap();

        let first = transport.read_reply().unwrap();
        let second = transport.read_reply().unwrap();
        assert_eq!(first.id, 41);
        assert_eq!(first.response, Response::Acknowledgement { affected: 0 });
        assert_eq!(second.id, 42);
        assert!(matches!(second.response, Response::RowSet(rows) if rows.is_empty()));
    }

    #[test]
    fn bad_credentials_end_the_session() {
        let (mut transport, reply) = handshake(spawn_server(), "wrong");

        assert!(matches!(
            reply.response,
            Response::Error {
                code: ErrorCode::Authentication,
                ..
            }
        ));
        assert!(matches!(
            transport.read_reply(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn queries_before_handshake_are_refused() {
        let address = spawn_server();
        let mut transport = ProtocolTransport::new(TcpStream::connect(address).unwrap());
        transport
            .write_command(&Command::query(1, "SELECT * FROM t;"))
            .unwrap();

        let reply = transport.read_reply().unwrap();
        assert!(matches!(
            reply.response,
            Response::Error {
                code: ErrorCode::Protocol,
                ..
            }
        ));
    }

    #[test]
    fn sessions_share_the_catalog() {
        let address = spawn_server();
        let (mut first, _) = handshake(address, "admin");
        let (mut second, _) = handshake(address, "admin");

        first
            .write_command(&Command::query(1, "CREATE TABLE shared (id SERIAL);"))
            .unwrap();
        first.read_reply().unwrap();
        second
            .write_command(&Command::query(1, "INSERT INTO shared VALUES (7);"))
            .unwrap();

        assert_eq!(
            second.read_reply().unwrap().response,
            Response::Acknowledgement { affected: 1 }
        );
    }

    #[test]
    fn connections_beyond_the_pool_are_told_the_server_is_busy() {
        let address = spawn_server_with(1);
        let (first, reply) = handshake(address, "admin");
        assert_eq!(reply.response, Response::HandshakeAccepted);

        let (_, reply) = handshake(address, "admin");
        assert_eq!(
            reply.response,
            Response::Error {
                code: ErrorCode::Protocol,
                message: "server busy".to_string(),
            }
        );

        // The worker frees up once the first client leaves.
        drop(first);
        let mut accepted = false;
        for _ in 0..100 {
            let (_, reply) = handshake(address, "admin");
            if reply.response == Response::HandshakeAccepted {
                accepted = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(accepted);
    }
}
