//! Transport boundary: the byte-stream abstraction the protocol engine
//! runs over, plus the optional capabilities a physical transport (HF
//! modem, packet TNC, telnet) may expose.
//!
//! Capabilities are explicit optional methods rather than downcasts; a
//! transport that lacks one inherits the no-op default.

pub mod telnet;

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

/// A connected, bidirectional byte stream suitable for a B2F exchange.
pub trait ExchangeStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Bytes still queued in the modem's transmit buffer, if the transport
    /// exposes them. Used only for progress accuracy.
    fn tx_buffer_len(&self) -> Option<usize> {
        None
    }

    /// Pushes any transport-internal buffering out to the physical medium,
    /// blocking until the data is on the air. Invoked after every
    /// compressed-payload transmission; a no-op for stream transports.
    fn flush_medium(&mut self) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    /// Asks the transport to switch into its conservative (robust)
    /// sub-mode. Returns false when unsupported.
    fn set_robust(&mut self, _robust: bool) -> bool {
        false
    }
}

impl ExchangeStream for tokio::net::TcpStream {}
impl ExchangeStream for tokio::io::DuplexStream {}

impl<T: ExchangeStream + ?Sized> ExchangeStream for Box<T> {
    fn tx_buffer_len(&self) -> Option<usize> {
        (**self).tx_buffer_len()
    }

    fn flush_medium(&mut self) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>> {
        (**self).flush_medium()
    }

    fn set_robust(&mut self, robust: bool) -> bool {
        (**self).set_robust(robust)
    }
}

/// Boxed stream as carried through the exchange queue.
pub type DynStream = Box<dyn ExchangeStream>;

/// A dial frequency in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frequency(pub u64);

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} kHz", self.0 as f64 / 1e3)
    }
}

/// Busy detector for a shared physical medium.
pub trait BusyChannelChecker: Send + Sync {
    /// Returns true while the channel is not clear.
    fn busy(&self) -> bool;
}

/// Polls the transport's busy detector until the channel clears. With
/// `ignore_busy` set, logs once and returns immediately.
pub async fn wait_clear(checker: &dyn BusyChannelChecker, ignore_busy: bool) {
    let mut printed = false;
    while checker.busy() {
        if ignore_busy {
            info!("ignoring busy channel");
            break;
        }
        if !printed {
            info!("waiting for clear channel...");
            printed = true;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

/// Optional beacon a listening transport may run while its listener is up.
pub trait Beacon: Send + Sync {
    fn start(&self) -> io::Result<()>;
    fn stop(&self);
}

/// A transport that can listen for incoming connections. `init` is retried
/// by the listener hub whenever it or the accept loop fails.
#[async_trait]
pub trait TransportListener: Send + Sync {
    fn name(&self) -> &str;

    /// Brings the underlying listener up, e.g. binds a socket or
    /// initializes a TNC.
    async fn init(&self) -> io::Result<Box<dyn Acceptor>>;

    /// The frequency the transport currently listens on, if it knows one.
    fn current_freq(&self) -> Option<Frequency> {
        None
    }

    /// The transport's beacon, if it has one.
    fn beacon(&self) -> Option<&dyn Beacon> {
        None
    }
}

/// An established listener producing accepted connections.
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<Accepted>;
}

/// One accepted inbound connection. Transports that learn the caller's
/// callsign at link setup report it here; others leave it unset.
pub struct Accepted {
    pub stream: DynStream,
    pub remote_call: Option<String>,
}
