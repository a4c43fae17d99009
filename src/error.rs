use std::io;
use thiserror::Error;

/// Errors raised by the broker client layer: remoting, routing and broker responses.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Bad endpoint address `{0}`")]
    BadAddress(String),

    #[error("Failed to connect to `{addr}`")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on connection")]
    Io(#[from] io::Error),

    #[error("Connect reset by peer")]
    ConnectionReset,

    #[error("Invalid frame `{0}`")]
    InvalidFrame(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u128),

    #[error("No route info of topic `{0}`")]
    NoRoute(String),

    #[error("Broker `{addr}` responded with code {code}: {remark}")]
    Broker {
        addr: String,
        code: i32,
        remark: String,
    },

    #[error("Message body size {size} exceeds the limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Client is not running")]
    NotRunning,

    #[error("No tokio runtime to drive the asynchronous send")]
    NoRuntime,

    #[error("unknown data store error")]
    Unknown,
}

impl ClientError {
    /// Whether another attempt, possibly against another broker, may succeed.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::Io(_)
                | ClientError::ConnectionReset
                | ClientError::Timeout(_)
                | ClientError::Broker { .. }
        )
    }
}

/// Errors surfaced by listener containers and the producer template.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Property '{0}' is required")]
    MissingProperty(&'static str),

    #[error("Property '{property}' was wrong: {reason}")]
    InvalidProperty {
        property: &'static str,
        reason: String,
    },

    #[error("container already started. {0}")]
    AlreadyStarted(String),

    #[error("container already destroyed. {0}")]
    Destroyed(String),

    #[error("{0}")]
    IllegalArgument(String),

    #[error("Failed to encode message body")]
    Encode(#[source] serde_json::Error),

    #[error("{operation} failed: {source}")]
    Send {
        operation: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("Broker client failure: {0}")]
    Client(#[source] ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_send_error_keeps_cause() {
        let err = MessagingError::Send {
            operation: "syncSend",
            source: ClientError::Timeout(3000),
        };
        assert_eq!(
            err.to_string(),
            "syncSend failed: Request timed out after 3000 ms"
        );
        let cause = err.source().and_then(|e| e.downcast_ref::<ClientError>());
        assert!(matches!(cause, Some(ClientError::Timeout(3000))));
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::ConnectionReset.is_retryable());
        assert!(!ClientError::MessageTooLarge { size: 2, limit: 1 }.is_retryable());
        assert!(!ClientError::NotRunning.is_retryable());
    }
}
