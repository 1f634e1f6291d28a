//! Exchange arbitration: a single-consumer job queue guaranteeing that at
//! most one session is on the air at any instant, no matter how many
//! transports are dialing or listening. Most radio links are half-duplex
//! and the mailbox must never see two concurrent exchanges.

mod state;

pub use state::{ConnectionState, HardAbortFn, Phase, PhaseGuard};

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::fbb::{Session, SessionError, TrafficStats};
use crate::transport::DynStream;

/// Builds the session for one job: target identity and role in, configured
/// session out.
pub type SessionFactory = Box<dyn Fn(&str, bool) -> Session + Send>;

struct ExchangeJob {
    stream: DynStream,
    target: String,
    master: bool,
    hard_abort: Option<HardAbortFn>,
    reply: oneshot::Sender<Result<TrafficStats, SessionError>>,
}

/// Owns the worker task and the job queue. Submitters block until their
/// exchange has fully run; they queue in submission order.
pub struct ExchangeArbiter {
    queue: mpsc::Sender<ExchangeJob>,
    state: Arc<ConnectionState>,
}

impl ExchangeArbiter {
    pub fn new(factory: SessionFactory) -> Self {
        let (queue, rx) = mpsc::channel(1);
        let state = Arc::new(ConnectionState::default());
        tokio::spawn(worker(factory, rx, Arc::clone(&state)));
        Self { queue, state }
    }

    /// The abort/inspection handle for whatever job is currently running.
    pub fn connection_state(&self) -> Arc<ConnectionState> {
        Arc::clone(&self.state)
    }

    /// Runs one exchange over the stream, blocking until it completes and
    /// returning its terminal result. Jobs run strictly one at a time in
    /// submission order.
    pub async fn submit(
        &self,
        stream: DynStream,
        target: &str,
        master: bool,
    ) -> Result<TrafficStats, SessionError> {
        self.submit_with_abort(stream, target, master, None).await
    }

    /// Like [`submit`](Self::submit), with a transport-specific hard-abort
    /// hook for dirty disconnects.
    pub async fn submit_with_abort(
        &self,
        stream: DynStream,
        target: &str,
        master: bool,
        hard_abort: Option<HardAbortFn>,
    ) -> Result<TrafficStats, SessionError> {
        let (reply, result) = oneshot::channel();
        let job = ExchangeJob {
            stream,
            target: target.to_string(),
            master,
            hard_abort,
            reply,
        };

        if self.queue.send(job).await.is_err() {
            return Err(SessionError::Aborted);
        }
        result.await.unwrap_or(Err(SessionError::Aborted))
    }
}

async fn worker(
    factory: SessionFactory,
    mut queue: mpsc::Receiver<ExchangeJob>,
    state: Arc<ConnectionState>,
) {
    while let Some(job) = queue.recv().await {
        let ExchangeJob {
            stream,
            target,
            master,
            hard_abort,
            reply,
        } = job;

        debug!(target_call = %target, master, "starting exchange");
        let session = factory(&target, master);

        let (guard, mut cancelled) = Arc::clone(&state).begin_exchange(&target, hard_abort);
        let result = tokio::select! {
            result = session.exchange(stream) => result,
            // Dropping the exchange future drops the stream: the graceful
            // abort, seen by the peer as EOF.
            _ = cancelled.changed() => Err(SessionError::Aborted),
        };
        drop(guard);

        if let Err(err) = &result {
            warn!(target_call = %target, %err, "exchange failed");
        }
        let _ = reply.send(result);
    }
}
