//! MaazDB client.
//!
//! [`MaazDB`] is the whole public surface most callers need:
//!
//! ```no_run
//! use maazdb::MaazDB;
//!
//! let db = MaazDB::connect("127.0.0.1", 8888, "admin", "admin")?;
//! db.query("CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT);")?;
//! db.query("INSERT INTO users (name) VALUES ('Maaz');")?;
//!
//! let results = db.query("SELECT * FROM users;")?;
//! println!("{results}");
//!
//! db.close();
//! # Ok::<(), maazdb::ClientError>(())
//! ```
//!
//! Underneath, a [`Connection`] owns the socket and its receive loop while a
//! [`QueryExecutor`] matches replies to callers by correlation id. `query` takes `&self`, so a
//! single connection can be shared between threads (for example behind an `Arc`) and carry
//! several outstanding queries at once.
//!
//! Set [`ClientConfig::tls`] to run the same protocol over TLS 1.3.
mod config;
mod connection;
mod error;
mod executor;

use std::{fmt, sync::Arc};

use log::info;

use crate::protocol::{NetworkStream, Response, RowSet, TlsStream};

pub use config::ClientConfig;
pub use connection::{Connection, ConnectionState, Credentials, Endpoint, tcp_connect};
pub use error::{ClientError, ClientResult};
pub use executor::{CommandSink, QueryExecutor};

/// Outcome of a successful query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Rows returned by a `SELECT`-like command.
    Rows(RowSet),
    /// Number of rows changed by any other command.
    Affected(u64),
}

impl QueryResult {
    pub fn rows(&self) -> Option<&RowSet> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            QueryResult::Affected(_) => None,
        }
    }

    pub fn affected(&self) -> Option<u64> {
        match self {
            QueryResult::Rows(_) => None,
            QueryResult::Affected(n) => Some(*n),
        }
    }
}

impl TryFrom<Response> for QueryResult {
    type Error = ClientError;

    fn try_from(value: Response) -> Result<Self, Self::Error> {
        match value {
            Response::RowSet(rows) => Ok(QueryResult::Rows(rows)),
            Response::Acknowledgement { affected } => Ok(QueryResult::Affected(affected)),
            Response::Error { code, message } => Err(ClientError::QueryFailed { code, message }),
            Response::HandshakeAccepted => Err(ClientError::UnexpectedResponse {
                expected: "query result",
                actual: "HandshakeAccepted".to_string(),
            }),
        }
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryResult::Rows(rows) => write!(f, "{rows}"),
            QueryResult::Affected(1) => write!(f, "1 row affected"),
            QueryResult::Affected(n) => write!(f, "{n} rows affected"),
        }
    }
}

/// A client holding one authenticated connection.
pub struct MaazDB {
    config: ClientConfig,
    connection: Connection<NetworkStream>,
    executor: Arc<QueryExecutor>,
}

impl MaazDB {
    /// Creates a disconnected client; see [`MaazDB::open`].
    pub fn new(config: ClientConfig) -> Self {
        Self {
            executor: Arc::new(QueryExecutor::new(config.query_timeout)),
            connection: Connection::new(config.clone()),
            config,
        }
    }

    /// Connects and authenticates with the default configuration.
    pub fn connect(host: &str, port: u16, user: &str, password: &str) -> ClientResult<Self> {
        Self::connect_with(ClientConfig::default(), host, port, user, password)
    }

    pub fn connect_with(
        config: ClientConfig,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> ClientResult<Self> {
        let db = Self::new(config);
        db.open(host, port, user, password)?;
        Ok(db)
    }

    /// Connects and authenticates this client.
    ///
    /// Fails with `AlreadyConnecting` while another `open` is mid-handshake. Any
    /// failure leaves the client closed.
    pub fn open(&self, host: &str, port: u16, user: &str, password: &str) -> ClientResult<()> {
        let endpoint = Endpoint::new(host, port);
        let credentials = Credentials::new(user, password);
        let timeout = self.config.connect_timeout;
        let tls = self.config.tls.as_ref();

        self.connection.open_with(
            || {
                let socket = tcp_connect(&endpoint, timeout)?;
                match tls {
                    Some(options) => TlsStream::connect(socket, options, &endpoint.host, timeout)
                        .map(NetworkStream::Tls),
                    None => Ok(NetworkStream::Plain(socket)),
                }
            },
            &credentials,
            Arc::clone(&self.executor),
        )?;
        info!(
            "connected to {endpoint} as '{user}'{}",
            if tls.is_some() { " over TLS" } else { "" }
        );
        Ok(())
    }

    /// Runs one command and waits for its result.
    ///
    /// A server-side rejection becomes [`ClientError::QueryFailed`] and leaves the
    /// connection usable.
    pub fn query(&self, text: &str) -> ClientResult<QueryResult> {
        match self.connection.state() {
            ConnectionState::Ready => {}
            ConnectionState::Closed => return Err(ClientError::ConnectionClosed),
            ConnectionState::Disconnected | ConnectionState::Handshaking => {
                return Err(ClientError::NotConnected);
            }
        }

        let response = self.executor.execute(&self.connection, text)?;
        QueryResult::try_from(response)
    }

    /// Closes the connection. Never fails and may be called repeatedly.
    pub fn close(&self) {
        self.connection.close();
        self.executor.fail_all();
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }
}

impl fmt::Debug for MaazDB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaazDB")
            .field("state", &self.state())
            .field("pending", &self.executor.pending())
            .finish_non_exhaustive()
    }
}

impl Drop for MaazDB {
    fn drop(&mut self) {
        self.close();
    }
}
