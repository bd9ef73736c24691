pub mod cli;
pub mod client;
pub mod protocol;
pub mod server;

pub use cli::{Input, prompt};
pub use client::{ClientConfig, ClientError, ClientResult, ConnectionState, MaazDB, QueryResult};
pub use protocol::{Row, RowSet, Value};
