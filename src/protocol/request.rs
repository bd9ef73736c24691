use bincode::{Decode, Encode};

/// Tags a [`Command`] and the [`Reply`](super::Reply) answering it.
pub type CorrelationId = u64;

/// Correlation id reserved for control messages (handshake, terminate);
/// queries start at 1.
pub const CONTROL_ID: CorrelationId = 0;

/// Client to server message body.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Request {
    /// Credential exchange; must be the first frame on a connection.
    Handshake { user: String, password: String },
    /// Raw command text to execute on the server.
    Query { text: String },
    /// Polite notice that the client is going away.
    Terminate,
}

/// An immutable request on the wire, paired with its correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CorrelationId,
    pub request: Request,
}

impl Command {
    pub fn handshake(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: CONTROL_ID,
            request: Request::Handshake {
                user: user.into(),
                password: password.into(),
            },
        }
    }

    pub fn query(id: CorrelationId, text: impl Into<String>) -> Self {
        Self {
            id,
            request: Request::Query { text: text.into() },
        }
    }

    pub fn terminate() -> Self {
        Self {
            id: CONTROL_ID,
            request: Request::Terminate,
        }
    }

    /// Bytes of caller-supplied text carried by the request: the query, or the
    /// credentials of a handshake.
    pub fn body_len(&self) -> usize {
        match &self.request {
            Request::Handshake { user, password } => user.len() + password.len(),
            Request::Query { text } => text.len(),
            Request::Terminate => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_uses_reserved_id() {
        let command = Command::handshake("admin", "admin");

        assert_eq!(command.id, CONTROL_ID);
        assert_eq!(command.body_len(), 10);
    }

    #[test]
    fn query_body_is_its_text() {
        let command = Command::query(7, "SELECT * FROM t;");

        assert_eq!(command.id, 7);
        assert_eq!(command.body_len(), "SELECT * FROM t;".len());
    }

    #[test]
    fn terminate_command() {
        let command = Command::terminate();

        assert_eq!(command.id, CONTROL_ID);
        assert_eq!(command.request, Request::Terminate);
        assert_eq!(command.body_len(), 0);
    }
}
