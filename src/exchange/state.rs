//! Process-wide connection state: whether a dial or an exchange is in
//! flight, and the abort control over it. Owned by the arbiter and passed
//! explicitly to whatever exposes the disconnect control (CLI, HTTP).

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{info, warn};

/// Transport-specific hard abort that does not wait for acknowledgement.
pub type HardAbortFn = Arc<dyn Fn() + Send + Sync>;

/// What the arbiter is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dialing,
    Exchanging,
}

#[derive(Default)]
struct Inner {
    phase: Option<Active>,
}

struct Active {
    phase: Phase,
    target: String,
    cancel: watch::Sender<bool>,
    hard_abort: Option<HardAbortFn>,
    graceful_attempted: bool,
}

/// Thread-safe snapshot of the single in-flight connection, with an abort
/// switch. The abort path runs concurrently with the exchange path.
#[derive(Default)]
pub struct ConnectionState {
    inner: Mutex<Inner>,
}

impl ConnectionState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.lock()
            .phase
            .as_ref()
            .map(|a| a.phase)
            .unwrap_or(Phase::Idle)
    }

    /// The target of the in-flight dial or exchange, if any.
    pub fn target(&self) -> Option<String> {
        self.lock().phase.as_ref().map(|a| a.target.clone())
    }

    /// Whether a graceful abort was already attempted on the current
    /// connection; the caller escalates to dirty on the next request.
    pub fn graceful_attempted(&self) -> bool {
        self.lock()
            .phase
            .as_ref()
            .map(|a| a.graceful_attempted)
            .unwrap_or(false)
    }

    /// Aborts the in-flight dial or exchange, if any. A graceful abort
    /// closes the stream and lets the peer see EOF; a dirty abort first
    /// fires the transport's hard-abort hook. Returns whether anything was
    /// aborted.
    pub fn abort(&self, dirty: bool) -> bool {
        let mut inner = self.lock();
        let Some(active) = inner.phase.as_mut() else {
            return false;
        };

        if dirty {
            match &active.hard_abort {
                Some(hook) => {
                    warn!(target_call = %active.target, "dirty disconnect");
                    hook();
                }
                None => warn!("dirty disconnect requested, transport has no hard abort"),
            }
        } else {
            info!(target_call = %active.target, "disconnecting...");
        }
        active.graceful_attempted = true;
        let _ = active.cancel.send(true);
        true
    }

    fn begin(
        &self,
        phase: Phase,
        target: &str,
        hard_abort: Option<HardAbortFn>,
    ) -> watch::Receiver<bool> {
        let (cancel, cancelled) = watch::channel(false);
        self.lock().phase = Some(Active {
            phase,
            target: target.to_string(),
            cancel,
            hard_abort,
            graceful_attempted: false,
        });
        cancelled
    }

    fn end(&self) {
        self.lock().phase = None;
    }

    /// Marks a dial in progress; the returned receiver fires on abort. The
    /// guard clears the state when dropped.
    pub fn begin_dial(self: Arc<Self>, target: &str) -> (PhaseGuard, watch::Receiver<bool>) {
        let rx = self.begin(Phase::Dialing, target, None);
        (PhaseGuard(self), rx)
    }

    pub(crate) fn begin_exchange(
        self: Arc<Self>,
        target: &str,
        hard_abort: Option<HardAbortFn>,
    ) -> (PhaseGuard, watch::Receiver<bool>) {
        let rx = self.begin(Phase::Exchanging, target, hard_abort);
        (PhaseGuard(self), rx)
    }
}

/// Clears the connection state when the dial or exchange ends.
pub struct PhaseGuard(Arc<ConnectionState>);

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn abort_without_connection_is_noop() {
        let state = ConnectionState::default();
        assert!(!state.abort(false));
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn graceful_abort_signals_cancel() {
        let state = Arc::new(ConnectionState::default());
        let (_guard, cancelled) = Arc::clone(&state).begin_exchange("N0CALL", None);
        assert_eq!(state.phase(), Phase::Exchanging);

        assert!(state.abort(false));
        assert!(*cancelled.borrow());
        assert!(state.graceful_attempted());
    }

    #[test]
    fn dirty_abort_fires_hook() {
        let fired = Arc::new(AtomicBool::new(false));
        let hook = {
            let fired = Arc::clone(&fired);
            Arc::new(move || fired.store(true, Ordering::SeqCst)) as HardAbortFn
        };

        let state = Arc::new(ConnectionState::default());
        let (_guard, _cancelled) = Arc::clone(&state).begin_exchange("N0CALL", Some(hook));
        assert!(state.abort(true));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn guard_clears_state() {
        let state = Arc::new(ConnectionState::default());
        {
            let (_guard, _rx) = Arc::clone(&state).begin_dial("N0CALL");
            assert_eq!(state.phase(), Phase::Dialing);
        }
        assert_eq!(state.phase(), Phase::Idle);
    }
}
