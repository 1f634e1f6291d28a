//! Listener hub: one supervisory loop per enabled transport. Each loop
//! brings the transport's listener up, retries forever on failure, runs the
//! beacon while the accept loop is healthy, and hands every accepted
//! connection to the exchange arbiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::exchange::ExchangeArbiter;
use crate::transport::{Acceptor, TransportListener};

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

struct ListenerShared {
    name: String,
    last_error: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl ListenerShared {
    fn set_error(&self, err: Option<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = err;
        }
    }

    fn healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self
                .last_error
                .lock()
                .map(|e| e.is_none())
                .unwrap_or(false)
    }
}

struct ListenerHandle {
    shared: Arc<ListenerShared>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Registry of enabled transports and their supervisory loops.
pub struct ListenerHub {
    arbiter: Arc<ExchangeArbiter>,
    listeners: Mutex<HashMap<String, ListenerHandle>>,
}

impl ListenerHub {
    pub fn new(arbiter: Arc<ExchangeArbiter>) -> Self {
        Self {
            arbiter,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Starts listening on the given transport. A transport that is
    /// already enabled is left untouched.
    pub fn enable(&self, transport: Arc<dyn TransportListener>) {
        let Ok(mut listeners) = self.listeners.lock() else {
            return;
        };
        let name = transport.name().to_string();
        if listeners.contains_key(&name) {
            return;
        }

        let shared = Arc::new(ListenerShared {
            name: name.clone(),
            last_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listen_loop(
            transport,
            Arc::clone(&self.arbiter),
            Arc::clone(&shared),
            shutdown_rx,
        ));

        listeners.insert(
            name,
            ListenerHandle {
                shared,
                shutdown,
                task,
            },
        );
    }

    /// Stops and removes the transport's listener. Safe to call while the
    /// loop is mid-retry; repeated calls are no-ops. Returns whether the
    /// transport was enabled.
    pub fn disable(&self, name: &str) -> bool {
        let handle = {
            let Ok(mut listeners) = self.listeners.lock() else {
                return false;
            };
            listeners.remove(name)
        };
        let Some(handle) = handle else {
            return false;
        };

        handle.shared.closed.store(true, Ordering::SeqCst);
        let _ = handle.shutdown.send(true);
        // An exchange in flight on this listener finishes on its own; the
        // loop observes the signal at its next await point.
        drop(handle.task);
        true
    }

    /// Names of the currently-healthy listeners, for status reporting.
    pub fn active(&self) -> Vec<String> {
        let Ok(listeners) = self.listeners.lock() else {
            return Vec::new();
        };
        let mut names: Vec<String> = listeners
            .values()
            .filter(|h| h.shared.healthy())
            .map(|h| h.shared.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Disables every listener.
    pub fn close_all(&self) {
        let names: Vec<String> = {
            let Ok(listeners) = self.listeners.lock() else {
                return;
            };
            listeners.keys().cloned().collect()
        };
        for name in names {
            self.disable(&name);
        }
    }
}

enum AcceptEnd {
    Shutdown,
    Failed(std::io::Error),
}

async fn listen_loop(
    transport: Arc<dyn TransportListener>,
    arbiter: Arc<ExchangeArbiter>,
    shared: Arc<ListenerShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Only the first failure of a streak is logged, with one recovery line
    // when the listener comes back; a flapping TNC must not flood the log.
    let mut silenced = false;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let acceptor = tokio::select! {
            result = transport.init() => match result {
                Ok(acceptor) => acceptor,
                Err(err) => {
                    shared.set_error(Some(err.to_string()));
                    if !silenced {
                        warn!(listener = %shared.name, %err, "listener failed");
                        warn!("will try to re-establish listener in the background...");
                        silenced = true;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_INTERVAL) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            },
            _ = shutdown.changed() => break,
        };

        shared.set_error(None);
        if silenced {
            info!(listener = %shared.name, "listener re-established");
            silenced = false;
        }

        if let Some(beacon) = transport.beacon() {
            if let Err(err) = beacon.start() {
                warn!(listener = %shared.name, %err, "beacon start failed");
            }
        }

        let end = accept_loop(&*transport, acceptor, &arbiter, &mut shutdown).await;

        if let Some(beacon) = transport.beacon() {
            beacon.stop();
        }

        match end {
            AcceptEnd::Shutdown => break,
            AcceptEnd::Failed(err) => {
                warn!(listener = %shared.name, %err, "accept failed");
                shared.set_error(Some(err.to_string()));
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
}

async fn accept_loop(
    transport: &dyn TransportListener,
    mut acceptor: Box<dyn Acceptor>,
    arbiter: &ExchangeArbiter,
    shutdown: &mut watch::Receiver<bool>,
) -> AcceptEnd {
    loop {
        let accepted = tokio::select! {
            result = acceptor.accept() => match result {
                Ok(accepted) => accepted,
                Err(err) => return AcceptEnd::Failed(err),
            },
            _ = shutdown.changed() => return AcceptEnd::Shutdown,
        };

        let remote_call = accepted
            .remote_call
            .unwrap_or_else(|| String::from("unknown"));
        match transport.current_freq() {
            Some(freq) => info!(
                listener = transport.name(),
                %remote_call, %freq, "got connect"
            ),
            None => info!(listener = transport.name(), %remote_call, "got connect"),
        }

        // The station that dialed in drives the session.
        match arbiter.submit(accepted.stream, &remote_call, false).await {
            Ok(_) => info!("disconnected"),
            Err(err) => warn!(%err, "exchange failed"),
        }
    }
}
