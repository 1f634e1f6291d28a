//! Progress reporting for ongoing payload transfers.

/// Which way the payload is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// A snapshot of one payload transfer in progress.
#[derive(Debug, Clone)]
pub struct TransferStatus {
    pub direction: TransferDirection,
    pub mid: String,
    pub title: String,
    pub bytes_transferred: usize,
    pub bytes_total: usize,
    pub done: bool,
}

/// Receives transfer snapshots at a fixed cadence and once on completion.
///
/// Push-only: implementations must return promptly and never block the
/// session's transfer loop.
pub trait StatusObserver: Send + Sync {
    fn update_status(&self, status: TransferStatus);
}

/// Message traffic totals for one exchange.
#[derive(Debug, Clone, Default)]
pub struct TrafficStats {
    /// MIDs delivered to the remote (rejected proposals excluded).
    pub sent: Vec<String>,
    /// MIDs received from the remote.
    pub received: Vec<String>,
}
