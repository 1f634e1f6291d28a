pub mod config;
pub mod exchange;
pub mod fbb;
pub mod listener;
pub mod mailbox;
pub mod transport;

// Re-export key types for easy testing
pub use exchange::{ConnectionState, ExchangeArbiter, Phase};
pub use fbb::{Address, Session, SessionError, TrafficStats};
pub use mailbox::{MailboxHandler, OutboundMessage, ReceivedMessage};
