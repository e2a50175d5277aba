use tokio_tungstenite::tungstenite;

/// Which queue raised an overflow alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Incoming => f.write_str("incoming"),
            Direction::Outgoing => f.write_str("outgoing"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A queue sat at capacity when a push landed on an alarm checkpoint.
    /// The frame was still enqueued; the producer is outrunning the consumer.
    #[error("{direction} queue is full ({depth} frames), the consumer may be stuck")]
    QueueOverflow { direction: Direction, depth: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("failed to reconnect after {attempts} attempts")]
    MaxReconnectExceeded { attempts: u32 },

    /// Reported in logs only; `send` still succeeds.
    #[error("frame dropped after {attempts} send attempts")]
    SendRetryExhausted { attempts: u32 },

    #[error("transport is already running")]
    AlreadyRunning,

    #[error("transport is not running")]
    NotRunning,

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to connect: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

impl TransportError {
    /// Classify a WebSocket error, folding every flavour of "the other side
    /// went away" into [`TransportError::ConnectionClosed`].
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        if is_connection_closed(&err) {
            Self::ConnectionClosed
        } else {
            Self::WebSocket(err)
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Whether a WebSocket error means the connection is gone for good.
pub fn is_connection_closed(err: &tungstenite::Error) -> bool {
    use tungstenite::error::ProtocolError;

    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(io_err) => matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::NotConnected
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_variants_are_classified() {
        assert!(is_connection_closed(&tungstenite::Error::ConnectionClosed));
        assert!(is_connection_closed(&tungstenite::Error::AlreadyClosed));
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(is_connection_closed(&tungstenite::Error::Io(reset)));
    }

    #[test]
    fn other_errors_are_not_closed() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = TransportError::from_tungstenite(tungstenite::Error::Io(refused));
        assert!(!err.is_connection_closed());
        assert!(matches!(err, TransportError::WebSocket(_)));
    }

    #[test]
    fn overflow_message_names_direction() {
        let err = TransportError::QueueOverflow {
            direction: Direction::Outgoing,
            depth: 1000,
        };
        assert_eq!(
            err.to_string(),
            "outgoing queue is full (1000 frames), the consumer may be stuck"
        );
    }
}
