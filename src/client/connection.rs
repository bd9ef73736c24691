//! Connection lifecycle: handshake, receive loop and shutdown.
//!
//! ```text
//! Disconnected --open--> Handshaking --accepted--> Ready --close / stream failure--> Closed
//!                             |                                                       ^
//!                             +------------- rejected / stream failure ---------------+
//! ```
//!
//! `Closed` is terminal. Once `Ready`, a dedicated thread reads replies and hands them to the
//! [`QueryExecutor`]; when the stream fails or the peer hangs up that thread marks the
//! connection `Closed` and fails every pending query.
//!
//! Every write is bounded by the query timeout. A write that times out may have left half a
//! frame on the wire, so it closes the connection as well.
use std::{
    fmt,
    net::{TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, trace, warn};

use crate::protocol::{
    CONTROL_ID, Command, ErrorCode, ProtocolTransport, Response, Stream, TransportError,
};

use super::{ClientConfig, ClientError, ClientResult, CommandSink, QueryExecutor};

/// Budget for the goodbye frame sent by [`Connection::close`].
const TERMINATE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Ready,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolves `endpoint` and connects to the first address that answers.
pub fn tcp_connect(endpoint: &Endpoint, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for address in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {address} failed: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{endpoint} did not resolve to any address"),
        )
    }))
}

/// The open half of a connection: writer plus the receive loop reading the other half.
struct Link<S: Stream> {
    writer: ProtocolTransport<S>,
    receiver: JoinHandle<()>,
}

/// Lock order: `state`, then `control`, then `link`.
pub struct Connection<S: Stream> {
    config: ClientConfig,
    state: Arc<Mutex<ConnectionState>>,
    /// Handle used only to shut the stream down, so a writer stuck under
    /// `link` never delays `close`.
    control: Mutex<Option<S>>,
    link: Mutex<Option<Link<S>>>,
}

impl<S: Stream> Connection<S> {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            control: Mutex::new(None),
            link: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Runs the handshake over the stream produced by `connect`.
    ///
    /// Only one handshake may be in flight; the connection ends up `Ready` on
    /// success and `Closed` on any failure.
    pub fn open_with<F>(
        &self,
        connect: F,
        credentials: &Credentials,
        executor: Arc<QueryExecutor>,
    ) -> ClientResult<()>
    where
        F: FnOnce() -> std::io::Result<S>,
    {
        {
            let mut state = lock(&self.state);
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Handshaking,
                ConnectionState::Handshaking => return Err(ClientError::AlreadyConnecting),
                ConnectionState::Ready => return Err(ClientError::AlreadyConnected),
                ConnectionState::Closed => return Err(ClientError::ConnectionClosed),
            }
        }

        let result = connect()
            .map_err(ClientError::from)
            .and_then(|stream| self.establish(stream, credentials, executor));

        if result.is_err() {
            *lock(&self.state) = ConnectionState::Closed;
        }
        result
    }

    fn establish(
        &self,
        stream: S,
        credentials: &Credentials,
        executor: Arc<QueryExecutor>,
    ) -> ClientResult<()> {
        let (writer, reader) = match self.handshake(&stream, credentials) {
            Ok(halves) => halves,
            Err(e) => {
                let _ = stream.shutdown();
                return Err(e);
            }
        };

        let mut state = lock(&self.state);
        if *state != ConnectionState::Handshaking {
            debug!("connection closed during handshake");
            let _ = stream.shutdown();
            return Err(ClientError::ConnectionClosed);
        }

        let loop_state = Arc::clone(&self.state);
        let receiver = thread::Builder::new()
            .name("maazdb-recv".into())
            .spawn(move || receive_loop(reader, executor, loop_state))?;

        *lock(&self.control) = Some(stream);
        *lock(&self.link) = Some(Link { writer, receiver });
        *state = ConnectionState::Ready;
        Ok(())
    }

    fn handshake(
        &self,
        stream: &S,
        credentials: &Credentials,
    ) -> ClientResult<(ProtocolTransport<S>, ProtocolTransport<S>)> {
        let mut writer =
            ProtocolTransport::with_command_limit(stream.try_clone()?, self.config.max_command_size);
        let mut reader = ProtocolTransport::new(stream.try_clone()?);

        stream.set_read_timeout(Some(self.config.handshake_timeout))?;
        stream.set_write_timeout(Some(self.config.handshake_timeout))?;
        writer.write_command(&Command::handshake(
            credentials.user.as_str(),
            credentials.password.as_str(),
        ))?;
        let reply = reader.read_reply()?;
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(Some(self.config.query_timeout))?;

        if reply.id != CONTROL_ID {
            return Err(ClientError::UnexpectedResponse {
                expected: "handshake reply",
                actual: format!("reply to #{}", reply.id),
            });
        }

        match reply.response {
            Response::HandshakeAccepted => {
                debug!("handshake accepted for user {}", credentials.user);
                Ok((writer, reader))
            }
            Response::Error {
                code: ErrorCode::Authentication,
                message,
            } => Err(ClientError::AuthenticationFailed(message)),
            other => Err(ClientError::UnexpectedResponse {
                expected: "HandshakeAccepted",
                actual: format!("{other:?}"),
            }),
        }
    }

    /// Moves the connection to `Closed`, releasing the stream.
    ///
    /// Safe to call in any state and any number of times. Never waits on a
    /// writer: if one is mid-frame the goodbye is skipped and the stream is
    /// shut down underneath it.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), ConnectionState::Closed);
        let Some(control) = lock(&self.control).take() else {
            return;
        };

        if previous == ConnectionState::Ready {
            self.send_terminate(&control);
        }
        if let Err(e) = control.shutdown() {
            trace!("shutdown after close: {e}");
        }

        let link = lock(&self.link).take();
        if let Some(link) = link {
            if link.receiver.join().is_err() {
                warn!("receive loop panicked");
            }
        }
        info!("connection closed");
    }

    fn send_terminate(&self, control: &S) {
        let mut link = match self.link.try_lock() {
            Ok(link) => link,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("writer busy; closing without terminate");
                return;
            }
        };
        let Some(link) = link.as_mut() else {
            return;
        };

        if let Err(e) = control.set_write_timeout(Some(TERMINATE_TIMEOUT)) {
            trace!("failed to bound terminate: {e}");
        }
        if let Err(e) = link.writer.write_command(&Command::terminate()) {
            debug!("failed to send terminate: {e}");
        }
    }

    /// Closes the connection after a failed write and wakes the receive loop,
    /// which then fails every pending query. Returns the state before.
    fn abort(&self) -> ConnectionState {
        let previous = std::mem::replace(&mut *lock(&self.state), ConnectionState::Closed);
        if let Some(control) = lock(&self.control).as_ref() {
            if let Err(e) = control.shutdown() {
                trace!("shutdown after failed write: {e}");
            }
        }
        previous
    }
}

impl<S: Stream> CommandSink for Connection<S> {
    fn submit(&self, command: &Command) -> ClientResult<()> {
        match self.state() {
            ConnectionState::Ready => {}
            ConnectionState::Closed => return Err(ClientError::ConnectionClosed),
            ConnectionState::Disconnected | ConnectionState::Handshaking => {
                return Err(ClientError::NotConnected);
            }
        }

        let written = {
            let mut link = lock(&self.link);
            let link = link.as_mut().ok_or(ClientError::ConnectionClosed)?;
            link.writer.write_command(command)
        };

        match written {
            Ok(()) => Ok(()),
            // Encoding failed before any byte was written.
            Err(TransportError::Codec(e)) => Err(e.into()),
            Err(e) => {
                if self.abort() == ConnectionState::Closed {
                    return Err(ClientError::ConnectionClosed);
                }
                if e.is_timeout() {
                    warn!(
                        "write of query #{} timed out; closing connection",
                        command.id
                    );
                    Err(ClientError::QueryTimeout {
                        id: command.id,
                        timeout: self.config.query_timeout,
                    })
                } else {
                    warn!("write of query #{} failed: {e}", command.id);
                    Err(e.into())
                }
            }
        }
    }
}

impl<S: Stream> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop<S: Stream>(
    mut reader: ProtocolTransport<S>,
    executor: Arc<QueryExecutor>,
    state: Arc<Mutex<ConnectionState>>,
) {
    loop {
        match reader.read_reply() {
            Ok(reply) => executor.dispatch(reply),
            Err(e) => {
                if *lock(&state) == ConnectionState::Closed {
                    debug!("receive loop stopping: {e}");
                } else if matches!(e, TransportError::Closed) {
                    info!("server closed the connection");
                } else {
                    warn!("connection failed: {e}");
                }
                break;
            }
        }
    }

    *lock(&state) = ConnectionState::Closed;
    let _ = reader.get_ref().shutdown();
    executor.fail_all();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(all(test, unix))]
mod tests {
    use std::{os::unix::net::UnixStream, thread, time::Instant};

    use crate::protocol::{Reply, Request, codec::DEFAULT_MAX_COMMAND_SIZE};

    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::default().with_handshake_timeout(Duration::from_secs(2))
    }

    fn executor() -> Arc<QueryExecutor> {
        Arc::new(QueryExecutor::new(Duration::from_secs(2)))
    }

    /// Plays the server side of a handshake, answering with `response`.
    fn fake_server(stream: UnixStream, response: Response) -> JoinHandle<ProtocolTransport<UnixStream>> {
        thread::spawn(move || {
            let mut transport = ProtocolTransport::new(stream);
            let command = transport.read_command().unwrap();
            assert!(matches!(command.request, Request::Handshake { .. }));
            transport
                .write_reply(&Reply::new(command.id, response))
                .unwrap();
            transport
        })
    }

    #[test]
    fn accepted_handshake_makes_connection_ready() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = fake_server(server, Response::HandshakeAccepted);
        let connection = Connection::new(config());

        connection
            .open_with(|| Ok(client), &Credentials::new("admin", "admin"), executor())
            .unwrap();

        assert_eq!(connection.state(), ConnectionState::Ready);
        server.join().unwrap();
    }

    #[test]
    fn rejected_credentials_close_the_connection() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = fake_server(
            server,
            Response::Error {
                code: ErrorCode::Authentication,
                message: "invalid credentials".into(),
            },
        );
        let connection = Connection::new(config());

        let err = connection
            .open_with(|| Ok(client), &Credentials::new("admin", "nope"), executor())
            .unwrap_err();

        assert!(matches!(err, ClientError::AuthenticationFailed(m) if m == "invalid credentials"));
        assert_eq!(connection.state(), ConnectionState::Closed);
        server.join().unwrap();
    }

    #[test]
    fn failed_connect_is_a_transport_error() {
        let connection = Connection::<UnixStream>::new(config());

        let err = connection
            .open_with(
                || Err(std::io::ErrorKind::ConnectionRefused.into()),
                &Credentials::new("admin", "admin"),
                executor(),
            )
            .unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn silent_server_times_out_handshake() {
        let (client, _server) = UnixStream::pair().unwrap();
        let connection =
            Connection::new(config().with_handshake_timeout(Duration::from_millis(50)));

        let err = connection
            .open_with(|| Ok(client), &Credentials::new("admin", "admin"), executor())
            .unwrap_err();

        assert!(matches!(&err, ClientError::Transport(e) if e.is_timeout()));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn concurrent_open_is_refused() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = fake_server(server, Response::HandshakeAccepted);
        let connection = Connection::new(config());
        let credentials = Credentials::new("admin", "admin");

        connection
            .open_with(
                || {
                    let nested = connection.open_with(
                        || unreachable!("second handshake must not connect"),
                        &credentials,
                        executor(),
                    );
                    assert!(matches!(nested, Err(ClientError::AlreadyConnecting)));
                    Ok(client)
                },
                &credentials,
                executor(),
            )
            .unwrap();

        let again = connection.open_with(
            || unreachable!("ready connection must not reconnect"),
            &credentials,
            executor(),
        );
        assert!(matches!(again, Err(ClientError::AlreadyConnected)));
        server.join().unwrap();
    }

    #[test]
    fn closed_is_terminal() {
        let connection = Connection::<UnixStream>::new(config());
        connection.close();
        connection.close();

        let err = connection
            .open_with(
                || unreachable!("closed connection must not connect"),
                &Credentials::new("admin", "admin"),
                executor(),
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert!(matches!(
            connection.submit(&Command::query(1, "SELECT 1;")),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[test]
    fn submit_before_open_is_refused() {
        let connection = Connection::<UnixStream>::new(config());

        assert!(matches!(
            connection.submit(&Command::query(1, "SELECT 1;")),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn close_sends_terminate_and_fails_pending() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = fake_server(server, Response::HandshakeAccepted);
        let connection = Connection::new(config());
        let executor = executor();

        connection
            .open_with(
                || Ok(client),
                &Credentials::new("admin", "admin"),
                Arc::clone(&executor),
            )
            .unwrap();
        let mut server = server.join().unwrap();

        connection.close();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(executor.is_closed());
        assert_eq!(server.read_command().unwrap(), Command::terminate());
    }

    #[test]
    fn stalled_peer_bounds_writes_and_close() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = fake_server(server, Response::HandshakeAccepted);
        let timeout = Duration::from_millis(200);
        let connection = Connection::new(config().with_query_timeout(timeout));
        let executor = Arc::new(QueryExecutor::new(timeout));

        connection
            .open_with(
                || Ok(client),
                &Credentials::new("admin", "admin"),
                Arc::clone(&executor),
            )
            .unwrap();
        // Keep the peer open but never read from it again.
        let _server = server.join().unwrap();

        let text = "x".repeat(DEFAULT_MAX_COMMAND_SIZE);
        let started = Instant::now();
        let err = executor.execute(&connection, &text).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3), "{err}");
        assert!(matches!(err, ClientError::QueryTimeout { id: 1, .. }));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(
            executor.execute(&connection, "SELECT 1;"),
            Err(ClientError::ConnectionClosed)
        ));

        let started = Instant::now();
        connection.close();
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn close_does_not_wait_for_a_blocked_writer() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = fake_server(server, Response::HandshakeAccepted);
        let connection = Connection::new(config().with_query_timeout(Duration::from_secs(30)));
        let executor = executor();

        connection
            .open_with(
                || Ok(client),
                &Credentials::new("admin", "admin"),
                Arc::clone(&executor),
            )
            .unwrap();
        let _server = server.join().unwrap();

        thread::scope(|scope| {
            let writer = scope.spawn(|| {
                let text = "x".repeat(DEFAULT_MAX_COMMAND_SIZE);
                executor.execute(&connection, &text)
            });
            while executor.pending() == 0 {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(100));

            let started = Instant::now();
            connection.close();
            assert!(started.elapsed() < Duration::from_secs(3));
            assert!(matches!(
                writer.join().unwrap(),
                Err(ClientError::ConnectionClosed)
            ));
        });
    }

    #[test]
    fn peer_hangup_closes_connection() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = fake_server(server, Response::HandshakeAccepted);
        let connection = Connection::new(config());
        let executor = executor();

        connection
            .open_with(
                || Ok(client),
                &Credentials::new("admin", "admin"),
                Arc::clone(&executor),
            )
            .unwrap();
        drop(server.join().unwrap());

        while !executor.is_closed() {
            thread::yield_now();
        }
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(
            executor.execute(&connection, "SELECT 1;"),
            Err(ClientError::ConnectionClosed)
        ));
    }
}
