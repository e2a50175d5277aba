//! Role picked at run time.

use crate::config::{LinkConfig, Role};
use crate::connecting::ConnectingTransport;
use crate::error::TransportError;
use crate::frame::Frame;
use crate::hosting::HostingTransport;
use crate::stats::TransportStats;
use crate::transport::{Transport, TransportCore};

/// Either role behind one type, for callers that choose from configuration.
pub enum AnyTransport {
    Hosting(HostingTransport),
    Connecting(ConnectingTransport),
}

impl AnyTransport {
    pub fn from_config(config: &LinkConfig) -> Result<Self, TransportError> {
        Ok(match config.role {
            Role::Hosting => Self::Hosting(HostingTransport::new(config.hosting.clone())),
            Role::Connecting => {
                Self::Connecting(ConnectingTransport::new(config.connecting.clone())?)
            }
        })
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Hosting(_) => Role::Hosting,
            Self::Connecting(_) => Role::Connecting,
        }
    }

    /// Where the transport listens or which URL it dials.
    pub fn endpoint(&self) -> Option<String> {
        match self {
            Self::Hosting(t) => t.url(),
            Self::Connecting(t) => Some(t.url().to_string()),
        }
    }
}

impl Transport for AnyTransport {
    async fn start(&self) -> Result<(), TransportError> {
        match self {
            Self::Hosting(t) => t.start().await,
            Self::Connecting(t) => t.start().await,
        }
    }

    async fn stop(&self) {
        match self {
            Self::Hosting(t) => t.stop().await,
            Self::Connecting(t) => t.stop().await,
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        match self {
            Self::Hosting(t) => t.send(frame).await,
            Self::Connecting(t) => t.send(frame).await,
        }
    }

    fn stats(&self) -> TransportStats {
        match self {
            Self::Hosting(t) => t.stats(),
            Self::Connecting(t) => t.stats(),
        }
    }

    fn core(&self) -> &TransportCore {
        match self {
            Self::Hosting(t) => t.core(),
            Self::Connecting(t) => t.core(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::RoleStats;

    #[test]
    fn role_follows_config() {
        let mut config = LinkConfig::default();
        let hosting = AnyTransport::from_config(&config).unwrap();
        assert_eq!(hosting.role(), Role::Hosting);
        assert!(hosting.endpoint().is_none());
        assert!(matches!(hosting.stats().role, RoleStats::Hosting { .. }));

        config.role = Role::Connecting;
        let connecting = AnyTransport::from_config(&config).unwrap();
        assert_eq!(connecting.role(), Role::Connecting);
        assert!(connecting.endpoint().unwrap().starts_with("ws://127.0.0.1:8080/"));
        assert!(matches!(connecting.stats().role, RoleStats::Connecting { .. }));
    }

    #[test]
    fn bad_connecting_url_fails_early() {
        let mut config = LinkConfig::default();
        config.role = Role::Connecting;
        config.connecting.host = "not a host".to_string();
        assert!(matches!(
            AnyTransport::from_config(&config),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn delegates_lifecycle() {
        let mut config = LinkConfig::default();
        config.hosting.port = 0;
        let transport = AnyTransport::from_config(&config).unwrap();
        transport.start().await.unwrap();
        assert!(transport.is_running());
        assert!(transport.endpoint().is_some());
        transport.send(Frame::from("queued")).await.unwrap();
        assert_eq!(transport.stats().outgoing(), 1);
        transport.stop().await;
        assert!(!transport.is_running());
    }
}
