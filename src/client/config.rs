use std::time::Duration;

use crate::protocol::{
    TlsOptions,
    codec::{DEFAULT_MAX_COMMAND_SIZE, MAX_COMMAND_SIZE},
};

/// Tunables for one client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Budget for establishing the TCP connection and any TLS handshake.
    pub connect_timeout: Duration,
    /// Budget for the server to answer the credential exchange.
    pub handshake_timeout: Duration,
    /// Budget for each query's response, and for each write to the socket.
    pub query_timeout: Duration,
    /// Longest accepted command text, in bytes. Never above [`MAX_COMMAND_SIZE`].
    pub max_command_size: usize,
    /// Encrypts the connection when set.
    pub tls: Option<TlsOptions>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
            max_command_size: DEFAULT_MAX_COMMAND_SIZE,
            tls: None,
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Sets the command size limit, clamped to what fits in one frame.
    pub fn with_max_command_size(mut self, bytes: usize) -> Self {
        self.max_command_size = bytes.min(MAX_COMMAND_SIZE);
        self
    }

    pub fn with_tls(mut self, options: TlsOptions) -> Self {
        self.tls = Some(options);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_limit_is_clamped_to_frame_capacity() {
        let config = ClientConfig::default().with_max_command_size(32 * 1024 * 1024);
        assert_eq!(config.max_command_size, MAX_COMMAND_SIZE);

        let config = ClientConfig::default().with_max_command_size(16);
        assert_eq!(config.max_command_size, 16);
    }

    #[test]
    fn plaintext_by_default() {
        let config = ClientConfig::default();

        assert!(config.tls.is_none());
        assert_eq!(config.max_command_size, DEFAULT_MAX_COMMAND_SIZE);
    }
}
