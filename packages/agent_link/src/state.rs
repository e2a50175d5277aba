use serde::{Deserialize, Serialize};

/// Lifecycle of a transport.
///
/// ```text
/// Stopped --start()--> Starting --ok--> Connected
///                                          |  ^
///                              socket lost v  | redial ok
///                                      Reconnecting --bound hit--> Failed
/// ```
///
/// `stop()` returns any state to `Stopped`, except `Failed`, which is kept so
/// the failure stays observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Stopped,
    Starting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether no further progress is possible without a new `start()`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Stopped | ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Starting => "starting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
