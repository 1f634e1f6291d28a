//! Telnet (plain TCP) transport: the only transport that needs no radio
//! hardware. Dials out for the `connect` command and listens for the hub.

use std::io;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use super::{Accepted, Acceptor, TransportListener};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8772";

/// Dials a remote station over TCP.
pub async fn dial(addr: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    info!(%addr, "telnet connection established");
    Ok(stream)
}

/// Listening side of the telnet transport.
pub struct TelnetTransport {
    bind_addr: String,
}

impl TelnetTransport {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
        }
    }
}

#[async_trait]
impl TransportListener for TelnetTransport {
    fn name(&self) -> &str {
        "telnet"
    }

    async fn init(&self) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!(addr = %self.bind_addr, "telnet listener bound");
        Ok(Box::new(TelnetAcceptor { listener }))
    }
}

struct TelnetAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TelnetAcceptor {
    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(Accepted {
            stream: Box::new(stream),
            // TCP reveals no callsign at link setup; the handshake will.
            remote_call: Some(peer.to_string()),
        })
    }
}
