//! agent_link - resilient bidirectional frame transport over WebSocket
//!
//! Two peers exchange opaque frames (text or binary WebSocket messages).
//! One side either listens for the other ([`HostingTransport`]) or dials an
//! external server ([`ConnectingTransport`]). Both share the same lifecycle
//! ([`Transport`]): bounded incoming queue, a single handler fed in receipt
//! order, a readiness latch, and idempotent shutdown.
//!
//! # Example
//!
//! ```no_run
//! use agent_link::{Frame, HostingConfig, HostingTransport, Transport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = HostingTransport::new(HostingConfig::default());
//!     transport.set_message_handler(|frame| {
//!         println!("received {} bytes", frame.len());
//!     });
//!
//!     transport.start().await.unwrap();
//!     transport.wait_for_ready(None).await;
//!     transport.send(Frame::from("hello")).await.unwrap();
//!
//!     transport.stop().await;
//! }
//! ```

pub mod any;
pub mod config;
pub mod connecting;
pub mod error;
pub mod frame;
pub mod hosting;
pub mod latch;
pub mod queue;
pub mod state;
pub mod stats;
pub mod transport;


pub use any::AnyTransport;
pub use config::{ConnectingConfig, HostingConfig, LinkConfig, QueueConfig, Role};
pub use connecting::ConnectingTransport;
pub use error::{Direction, TransportError};
pub use frame::Frame;
pub use hosting::HostingTransport;
pub use latch::ReadinessLatch;
pub use queue::{BoundedQueue, PushOutcome};
pub use state::ConnectionState;
pub use stats::{RoleStats, TransportStats};
pub use transport::{MessageHandler, Transport, TransportCore};
